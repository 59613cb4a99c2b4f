//! The rendition pipeline: fans one input video out into every ladder
//! variant, tracks completion, and assembles the master manifest.
//!
//! All variant encodes for a run execute concurrently; their results flow
//! through a channel into a single coordinator task that owns the completed
//! count and the manifest entries. The emitted master manifest always lists
//! variants in ladder order, not in completion order.

use crate::ladder::RenditionSpec;
use crate::manifest::{MasterPlaylist, VariantEntry};
use crate::transcoder::VariantEncoder;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Maximum number of uploads transcoding at the same time
pub const MAX_CONCURRENT_RUNS: usize = 2;

#[derive(Debug)]
pub enum PipelineError {
    /// Input path missing or not a regular file
    InputNotFound(PathBuf),
    /// Input exists but the media engine cannot read it
    Probe { path: PathBuf, detail: String },
    /// Output root could not be created
    OutputRoot { path: PathBuf, source: io::Error },
    /// A variant output directory could not be created
    VariantDir { path: PathBuf, source: io::Error },
    /// The encode for one variant failed
    Encode { height: u32, detail: String },
    /// Writing the master manifest failed
    Manifest(io::Error),
    /// The run ended without reporting a terminal outcome
    Aborted,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InputNotFound(path) => {
                write!(f, "Input file not found: {}", path.display())
            }
            PipelineError::Probe { path, detail } => {
                write!(f, "Input {} is not readable media: {}", path.display(), detail)
            }
            PipelineError::OutputRoot { path, source } => {
                write!(f, "Cannot prepare output root {}: {}", path.display(), source)
            }
            PipelineError::VariantDir { path, source } => {
                write!(f, "Cannot create variant directory {}: {}", path.display(), source)
            }
            PipelineError::Encode { height, detail } => {
                write!(f, "Variant {}p encode failed: {}", height, detail)
            }
            PipelineError::Manifest(e) => write!(f, "Failed to write master manifest: {}", e),
            PipelineError::Aborted => write!(f, "Run ended without a terminal outcome"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::OutputRoot { source, .. } => Some(source),
            PipelineError::VariantDir { source, .. } => Some(source),
            PipelineError::Manifest(e) => Some(e),
            _ => None,
        }
    }
}

/// One variant encode: a rendition spec bound to its output locations under
/// the run's output root.
#[derive(Debug, Clone)]
struct EncodeJob {
    spec: RenditionSpec,
    variant_dir: PathBuf,
    playlist_path: PathBuf,
}

impl EncodeJob {
    fn new(spec: RenditionSpec, output_root: &Path) -> Self {
        let variant_dir = output_root.join(spec.variant_dir_name());
        let playlist_path = variant_dir.join("playlist.m3u8");
        Self {
            spec,
            variant_dir,
            playlist_path,
        }
    }

    fn segment_pattern(&self) -> PathBuf {
        self.variant_dir.join("segment_%03d.ts")
    }
}

/// Handle to one running pipeline invocation. The terminal outcome is
/// delivered exactly once: either the master manifest path or the first
/// variant failure.
pub struct TranscodeRun {
    rx: oneshot::Receiver<Result<PathBuf, PipelineError>>,
}

impl TranscodeRun {
    /// Wait for the run to reach its terminal state.
    pub async fn outcome(self) -> Result<PathBuf, PipelineError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Aborted),
        }
    }
}

/// Launch the rendition pipeline for one input video.
///
/// Preconditions are checked before anything is created under `output_root`:
/// the input must be an existing regular file the media engine can probe, and
/// the output root must be creatable. The encode jobs themselves run in the
/// background; the returned handle resolves once they all finish or the first
/// one fails.
pub async fn start<E>(
    encoder: Arc<E>,
    ladder: &[RenditionSpec],
    input: &Path,
    output_root: &Path,
) -> Result<TranscodeRun, PipelineError>
where
    E: VariantEncoder + Send + Sync + 'static,
{
    let metadata = tokio::fs::metadata(input)
        .await
        .map_err(|_| PipelineError::InputNotFound(input.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(PipelineError::InputNotFound(input.to_path_buf()));
    }

    let probe = encoder.probe_input(input).await.map_err(|e| PipelineError::Probe {
        path: input.to_path_buf(),
        detail: e.to_string(),
    })?;
    if !probe.status.success() {
        return Err(PipelineError::Probe {
            path: input.to_path_buf(),
            detail: String::from_utf8_lossy(&probe.stderr).trim().to_string(),
        });
    }

    tokio::fs::create_dir_all(output_root)
        .await
        .map_err(|e| PipelineError::OutputRoot {
            path: output_root.to_path_buf(),
            source: e,
        })?;

    // Re-running over an existing output tree is fine: directory creation is
    // idempotent.
    let jobs: Vec<EncodeJob> = ladder
        .iter()
        .map(|spec| EncodeJob::new(*spec, output_root))
        .collect();
    for job in &jobs {
        tokio::fs::create_dir_all(&job.variant_dir)
            .await
            .map_err(|e| PipelineError::VariantDir {
                path: job.variant_dir.clone(),
                source: e,
            })?;
    }

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let master_path = output_root.join("master.m3u8");

    tokio::spawn(coordinate(
        encoder,
        jobs,
        input.to_path_buf(),
        master_path,
        outcome_tx,
    ));

    Ok(TranscodeRun { rx: outcome_rx })
}

/// Single-writer coordinator for one run. Owns the completed-job count and
/// the ladder-indexed manifest entries, so concurrent completions cannot
/// lose updates or interleave.
///
/// Failure policy: the first variant error resolves the run immediately and
/// suppresses manifest assembly. In-flight siblings are left to finish; their
/// late results are drained and logged only.
async fn coordinate<E>(
    encoder: Arc<E>,
    jobs: Vec<EncodeJob>,
    input: PathBuf,
    master_path: PathBuf,
    outcome_tx: oneshot::Sender<Result<PathBuf, PipelineError>>,
) where
    E: VariantEncoder + Send + Sync + 'static,
{
    let total = jobs.len();
    let (tx, mut rx) = mpsc::channel(total.max(1));

    for (index, job) in jobs.into_iter().enumerate() {
        let encoder = Arc::clone(&encoder);
        let input = input.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = encode_one(encoder.as_ref(), &input, &job).await;
            let _ = tx.send((index, result)).await;
        });
    }
    drop(tx);

    let mut entries: Vec<Option<VariantEntry>> = (0..total).map(|_| None).collect();
    let mut completed = 0usize;
    let mut outcome_tx = Some(outcome_tx);

    while let Some((index, result)) = rx.recv().await {
        match result {
            Ok(entry) => {
                entries[index] = Some(entry);
                completed += 1;
                info!(completed, total, "variant finished");

                if completed == total {
                    if let Some(tx) = outcome_tx.take() {
                        let _ = tx.send(write_master(&entries, &master_path).await);
                    }
                }
            }
            Err(e) => match outcome_tx.take() {
                Some(tx) => {
                    error!(error = %e, "variant failed, aborting manifest assembly");
                    let _ = tx.send(Err(e));
                }
                None => warn!(error = %e, "late variant failure after run resolved"),
            },
        }
    }

    // Only reached with the sender still in hand when a job vanished without
    // reporting, or the ladder was empty.
    if let Some(tx) = outcome_tx.take() {
        let result = if completed == total {
            write_master(&entries, &master_path).await
        } else {
            Err(PipelineError::Aborted)
        };
        let _ = tx.send(result);
    }
}

async fn encode_one<E>(
    encoder: &E,
    input: &Path,
    job: &EncodeJob,
) -> Result<VariantEntry, PipelineError>
where
    E: VariantEncoder + ?Sized,
{
    info!(height = job.spec.height, "starting variant encode");

    let output = encoder
        .encode_variant(input, job.spec, &job.segment_pattern(), &job.playlist_path)
        .await
        .map_err(|e| PipelineError::Encode {
            height: job.spec.height,
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(PipelineError::Encode {
            height: job.spec.height,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!(
        height = job.spec.height,
        playlist = %job.playlist_path.display(),
        "variant encode finished"
    );

    Ok(VariantEntry::for_spec(&job.spec))
}

/// Assemble the master manifest in ladder order. Only called once every slot
/// is filled.
async fn write_master(
    entries: &[Option<VariantEntry>],
    master_path: &Path,
) -> Result<PathBuf, PipelineError> {
    let mut playlist = MasterPlaylist::new();
    for entry in entries.iter().flatten() {
        playlist.add_variant(entry.clone());
    }

    playlist
        .write_to(master_path)
        .await
        .map_err(PipelineError::Manifest)?;

    info!(path = %master_path.display(), "master manifest written");

    Ok(master_path.to_path_buf())
}
