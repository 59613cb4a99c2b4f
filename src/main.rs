mod config;
mod ladder;
mod manifest;
mod pipeline;
mod transcoder;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    BoxError, Json, Router,
};
use futures::{Stream, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::File, io::BufWriter, sync::Semaphore};
use tokio_util::io::StreamReader;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::pipeline::MAX_CONCURRENT_RUNS;
use crate::transcoder::FfmpegEncoder;

struct AppState {
    config: Config,
    encoder: Arc<FfmpegEncoder>,
    run_permits: Arc<Semaphore>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    let addr = format!("{}:{}", config.addr, config.port);
    let is_test = config.is_test;

    let state = Arc::new(AppState {
        encoder: Arc::new(FfmpegEncoder),
        run_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS)),
        config,
    });

    let mut router = Router::new()
        .route("/upload", post(upload_video))
        .route("/outputs/:video_id/status", get(video_status))
        .route("/outputs/:video_id/*path", get(serve_output))
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    if is_test {
        router = router.route("/", get(demo_page));
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind TCP listener");
    info!("Listening at {}", addr);
    axum::serve(listener, router)
        .await
        .expect("Server failed to start");
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    video_id: String,
    /// URL path of the master manifest the player should load
    playlist: String,
}

/// Accepts a multipart upload, streams the `video` field to disk and starts
/// a rendition pipeline run in the background. Responds as soon as the file
/// is on disk; the processing outcome is observed via `/outputs/{id}/status`
/// or by fetching the master manifest.
async fn upload_video(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    while let Ok(Some(field)) = multipart.next_field().await {
        let file_name = if let Some(file_name) = field.file_name() {
            file_name.to_owned()
        } else {
            continue;
        };

        if field.name() != Some("video") {
            continue;
        }

        let video_id = Uuid::new_v4().to_string();
        let video_dir = PathBuf::from(&state.config.upload_dir).join(&video_id);
        tokio::fs::create_dir_all(&video_dir)
            .await
            .map_err(internal_error)?;

        let extension = Path::new(&file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let source_path = video_dir.join(format!("source.{}", extension));

        info!(%video_id, %file_name, "saving upload to {:?}", source_path);
        stream_to_file(&source_path, field).await?;

        spawn_run(state.clone(), video_id.clone(), source_path, video_dir);

        let playlist = format!("/outputs/{}/master.m3u8", video_id);
        return Ok(Json(UploadResponse { video_id, playlist }));
    }

    Err((StatusCode::BAD_REQUEST, "No video file in request".to_owned()))
}

/// Runs the pipeline in the background, gated by the run semaphore so at
/// most MAX_CONCURRENT_RUNS uploads transcode at once. Waiting for a permit
/// happens here, never in the request handler.
fn spawn_run(state: Arc<AppState>, video_id: String, source_path: PathBuf, output_root: PathBuf) {
    tokio::spawn(async move {
        let _permit = match state.run_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let run = match pipeline::start(
            state.encoder.clone(),
            ladder::ladder(),
            &source_path,
            &output_root,
        )
        .await
        {
            Ok(run) => run,
            Err(e) => {
                error!(%video_id, error = %e, "rendition pipeline rejected input");
                return;
            }
        };

        match run.outcome().await {
            Ok(master) => info!(%video_id, "video ready at {:?}", master),
            Err(e) => error!(%video_id, error = %e, "video processing failed"),
        }
    });
}

/// Reports whether a video's master manifest exists yet. Processing state is
/// observed through the filesystem only; there is no push notification to
/// the uploader.
async fn video_status(
    State(state): State<Arc<AppState>>,
    UrlPath(video_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !path_is_valid(Path::new(&video_id)) {
        return Err((StatusCode::BAD_REQUEST, "Invalid video id".to_owned()));
    }

    let master = PathBuf::from(&state.config.upload_dir)
        .join(&video_id)
        .join("master.m3u8");
    let status = if tokio::fs::try_exists(&master).await.unwrap_or(false) {
        "ready"
    } else {
        "processing"
    };

    Ok(Json(json!({ "video_id": video_id, "status": status })))
}

/// Plain static serving of the produced HLS files (master manifest, variant
/// playlists, media segments). Playback clients do their own adaptive
/// switching on top of this.
async fn serve_output(
    State(state): State<Arc<AppState>>,
    UrlPath((video_id, path)): UrlPath<(String, String)>,
) -> Result<Response, (StatusCode, String)> {
    let relative = Path::new(&video_id).join(&path);
    if !path_is_valid(&relative) {
        return Err((StatusCode::BAD_REQUEST, "Invalid path".to_owned()));
    }

    let full = PathBuf::from(&state.config.upload_dir).join(relative);
    let data = match tokio::fs::read(&full).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err((StatusCode::NOT_FOUND, "Not found".to_owned()))
        }
        Err(e) => return Err(internal_error(e)),
    };

    let content_type = mime_guess::from_path(&full)
        .first_or_octet_stream()
        .to_string();

    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

// Save a `Stream` to a file
async fn stream_to_file<S, E>(path: &PathBuf, stream: S) -> Result<(), (StatusCode, String)>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    async {
        let body_with_io_error = stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let body_reader = StreamReader::new(body_with_io_error);
        futures::pin_mut!(body_reader);

        let mut file = BufWriter::new(File::create(path).await?);
        tokio::io::copy(&mut body_reader, &mut file).await?;

        Ok::<_, io::Error>(())
    }
    .await
    .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

/// Rejects paths that could escape the upload directory.
fn path_is_valid(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn demo_page() -> Html<&'static str> {
    Html(DEMO_PAGE)
}

/// Minimal upload-and-play page: posts to /upload, polls the status
/// endpoint, then attaches hls.js to the master manifest. The hls.js client
/// performs the adaptive quality switching.
const DEMO_PAGE: &str = r#"<!doctype html>
<html>
    <head>
        <title>Upload something!</title>
        <script src="https://cdn.jsdelivr.net/npm/hls.js@1"></script>
    </head>
    <body>
        <h1>Upload a video</h1>
        <form id="upload-form">
            <input type="file" name="video" accept="video/*">
            <button type="submit">Upload</button>
        </form>
        <p id="status"></p>
        <video id="player" controls width="640"></video>
        <script>
            const form = document.getElementById('upload-form');
            const status = document.getElementById('status');
            const player = document.getElementById('player');

            form.addEventListener('submit', async (event) => {
                event.preventDefault();
                status.textContent = 'Uploading...';
                const response = await fetch('/upload', {
                    method: 'POST',
                    body: new FormData(form),
                });
                if (!response.ok) {
                    status.textContent = 'Upload failed: ' + await response.text();
                    return;
                }
                const { video_id, playlist } = await response.json();
                status.textContent = 'Processing ' + video_id + '...';
                const poll = setInterval(async () => {
                    const res = await fetch('/outputs/' + video_id + '/status');
                    const body = await res.json();
                    if (body.status === 'ready') {
                        clearInterval(poll);
                        status.textContent = 'Ready';
                        if (Hls.isSupported()) {
                            const hls = new Hls();
                            hls.loadSource(playlist);
                            hls.attachMedia(player);
                        } else {
                            player.src = playlist;
                        }
                        player.play();
                    }
                }, 2000);
            });
        </script>
    </body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_stream_to_file() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_file.txt");

        type E = std::io::Error;

        let test_data = "Hello, world!";
        let mock_stream = stream::iter(vec![Ok::<bytes::Bytes, E>(Bytes::from(test_data))]);

        let result = stream_to_file(&file_path, mock_stream).await;

        assert!(result.is_ok());

        let file_contents = fs::read_to_string(file_path).unwrap();
        assert_eq!(file_contents, test_data);
    }

    #[tokio::test]
    async fn test_stream_to_file_error() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_file.txt");

        let mock_stream = stream::iter(vec![Err("Test error")]);

        let result = stream_to_file(&file_path, mock_stream).await;

        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err(),
            (StatusCode::INTERNAL_SERVER_ERROR, "Test error".to_string())
        );
    }

    #[test]
    fn test_valid_single_component() {
        assert!(path_is_valid(Path::new("0d9be8ab-9d09-4f30-9b38-b6c65a4f2a1b")));
    }

    #[test]
    fn test_valid_nested_variant_path() {
        assert!(path_is_valid(Path::new("video_720p/playlist.m3u8")));
    }

    #[test]
    fn test_invalid_path_with_parent() {
        assert!(!path_is_valid(Path::new("../etc/passwd")));
    }

    #[test]
    fn test_invalid_absolute_path() {
        assert!(!path_is_valid(Path::new("/etc/passwd")));
    }
}
