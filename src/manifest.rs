use crate::ladder::RenditionSpec;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// One variant reference in the master manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    /// BANDWIDTH attribute in bits per second
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
    /// Variant playlist URI relative to the master manifest
    pub uri: String,
}

impl VariantEntry {
    pub fn for_spec(spec: &RenditionSpec) -> Self {
        Self {
            bandwidth: spec.bandwidth(),
            width: spec.width,
            height: spec.height,
            uri: spec.playlist_rel_path(),
        }
    }
}

/// The master manifest: the top-level playlist referencing every variant.
/// Entries are written in the order they were added.
pub struct MasterPlaylist {
    pub entries: Vec<VariantEntry>,
}

impl MasterPlaylist {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add_variant(&mut self, entry: VariantEntry) {
        self.entries.push(entry);
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = File::create(path).await?;

        file.write_all(b"#EXTM3U\n").await?;

        for entry in &self.entries {
            file.write_all(
                format!(
                    "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n",
                    entry.bandwidth, entry.width, entry.height
                )
                .as_bytes(),
            )
            .await?;
            file.write_all(entry.uri.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }

        file.flush().await?;

        Ok(())
    }
}
