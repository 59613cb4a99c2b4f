//! Environment configuration.

use std::env;

/// Runtime configuration, loaded from environment variables with defaults
/// suitable for local development.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Directory holding uploads and the HLS output trees
    pub upload_dir: String,
    /// Serve the built-in demo page at `/`
    pub is_test: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("3000")),
            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| String::from("./uploads")),
            is_test: env::var("IS_TEST")
                .unwrap_or_else(|_| String::from("true"))
                .parse()
                .unwrap_or(true),
        }
    }
}
