use crate::ladder::RenditionSpec;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Output;
use tokio::process::Command as TokioCommand;

/// Boundary to the external media engine. One `encode_variant` call per
/// rendition; the engine owns all codec, scaling and segmentation work.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait VariantEncoder {
    async fn encode_variant(
        &self,
        input: &Path,
        spec: RenditionSpec,
        segment_pattern: &Path,
        playlist_path: &Path,
    ) -> io::Result<Output>;

    async fn probe_input(&self, input: &Path) -> io::Result<Output>;
}

/// Fixed per-variant encode options: scale filter, target bit rate, codec
/// selection, 10 second VOD segments.
pub fn hls_args(spec: RenditionSpec) -> Vec<String> {
    vec![
        "-vf".to_string(),
        format!("scale=w={}:h={}", spec.width, spec.height),
        "-b:v".to_string(),
        format!("{}k", spec.bitrate_kbps),
        "-codec:v".to_string(),
        "libx264".to_string(),
        "-codec:a".to_string(),
        "aac".to_string(),
        "-hls_time".to_string(),
        "10".to_string(),
        "-hls_playlist_type".to_string(),
        "vod".to_string(),
    ]
}

pub struct FfmpegEncoder;

#[async_trait]
impl VariantEncoder for FfmpegEncoder {
    async fn encode_variant(
        &self,
        input: &Path,
        spec: RenditionSpec,
        segment_pattern: &Path,
        playlist_path: &Path,
    ) -> io::Result<Output> {
        let mut command = TokioCommand::new("ffmpeg");
        command.arg("-y").arg("-i").arg(input);
        for arg in hls_args(spec) {
            command.arg(arg);
        }
        command.arg("-hls_segment_filename").arg(segment_pattern);
        command.arg(playlist_path);
        command.output().await
    }

    async fn probe_input(&self, input: &Path) -> io::Result<Output> {
        TokioCommand::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(input)
            .output()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hls_args_for_spec() {
        let spec = RenditionSpec {
            width: 1280,
            height: 720,
            bitrate_kbps: 2500,
        };
        let args = hls_args(spec);

        assert!(args.contains(&"scale=w=1280:h=720".to_string()));
        assert!(args.contains(&"2500k".to_string()));
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"aac".to_string()));

        let hls_time = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[hls_time + 1], "10");
        let playlist_type = args.iter().position(|a| a == "-hls_playlist_type").unwrap();
        assert_eq!(args[playlist_type + 1], "vod");
    }
}
