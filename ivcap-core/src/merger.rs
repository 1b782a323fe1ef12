//! Reassembles stored fragments into one container file.
//!
//! Fragments after index 0 are headerless continuations of the same stream,
//! so the merge is a byte-exact concatenation in index order. No remuxing
//! happens here; the transcoder is the first consumer that decodes the media.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::chunk_store::{ChunkStore, ChunkStoreError, StoredFragment};
use crate::exec::{self, CommandExecutor, CommandOutcome};

pub type MergeResult<T> = Result<T, MergeError>;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("session {session_id} has no stored fragments")]
    NoFragments { session_id: String },
    #[error("session {session_id} cannot be merged: {detail}")]
    MissingHeader { session_id: String, detail: String },
    #[error("session {session_id} is missing fragments {missing:?}")]
    GapDetected { session_id: String, missing: Vec<u64> },
    #[error("merged file {path} has no video stream")]
    NoVideoStream { path: PathBuf },
    #[error("probe of {path} failed: {detail}")]
    Probe { path: PathBuf, detail: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Chunks(#[from] ChunkStoreError),
}

/// What to do when the stored indices are not a contiguous prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Merge what is present, in order, and log the gap.
    #[default]
    BestEffort,
    /// Abort before writing anything.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Matroska,
    Mp4,
}

impl ContainerKind {
    const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

    /// Recognises the container from the first bytes of fragment 0.
    pub fn sniff(head: &[u8]) -> Option<Self> {
        if head.starts_with(&Self::EBML_MAGIC) {
            Some(ContainerKind::Matroska)
        } else if head.len() >= 8 && &head[4..8] == b"ftyp" {
            Some(ContainerKind::Mp4)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerKind::Matroska => "webm",
            ContainerKind::Mp4 => "mp4",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub format_name: String,
    pub duration_seconds: Option<f64>,
    pub video_streams: usize,
    pub audio_streams: usize,
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> MergeResult<ProbeSummary>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

impl From<FfprobeOutput> for ProbeSummary {
    fn from(output: FfprobeOutput) -> Self {
        let count = |kind: &str| {
            output
                .streams
                .iter()
                .filter(|stream| stream.codec_type.as_deref() == Some(kind))
                .count()
        };
        let (format_name, duration_seconds) = match &output.format {
            Some(format) => (
                format.format_name.clone().unwrap_or_default(),
                format
                    .duration
                    .as_deref()
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .filter(|value| value.is_finite() && *value > 0.0),
            ),
            None => (String::new(), None),
        };
        ProbeSummary {
            format_name,
            duration_seconds,
            video_streams: count("video"),
            audio_streams: count("audio"),
        }
    }
}

pub struct FfprobeProbe {
    executor: Arc<dyn CommandExecutor>,
    binary: PathBuf,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(executor: Arc<dyn CommandExecutor>, binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executor,
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> MergeResult<ProbeSummary> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path);
        let failure = |detail: String| MergeError::Probe {
            path: path.to_path_buf(),
            detail,
        };
        let output = exec::run_checked(self.executor.as_ref(), &mut command, self.timeout)
            .await
            .map_err(|outcome| {
                failure(match outcome {
                    CommandOutcome::Spawn(err) => format!("could not start ffprobe: {err}"),
                    CommandOutcome::TimedOut(limit) => format!("ffprobe timed out after {limit:?}"),
                    CommandOutcome::Failed { stderr, .. } => stderr,
                })
            })?;
        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|err| failure(format!("invalid ffprobe payload: {err}")))?;
        Ok(parsed.into())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub session_id: String,
    pub merged_path: PathBuf,
    pub container: ContainerKind,
    pub fragment_count: usize,
    pub bytes: u64,
    pub missing_indices: Vec<u64>,
    pub probe: ProbeSummary,
}

/// Indices absent from `0..=max(present)`. Input must be sorted.
pub fn find_gaps(sorted_indices: &[u64]) -> Vec<u64> {
    let mut missing = Vec::new();
    let mut expected = 0u64;
    for &index in sorted_indices {
        while expected < index {
            missing.push(expected);
            expected += 1;
        }
        expected = index + 1;
    }
    missing
}

pub struct Merger {
    chunks: ChunkStore,
    probe: Arc<dyn MediaProbe>,
    gap_policy: GapPolicy,
    file_stem: String,
}

impl Merger {
    pub fn new(chunks: ChunkStore, probe: Arc<dyn MediaProbe>, gap_policy: GapPolicy) -> Self {
        Self {
            chunks,
            probe,
            gap_policy,
            file_stem: "merged".to_string(),
        }
    }

    pub fn with_file_stem(mut self, stem: impl Into<String>) -> Self {
        self.file_stem = stem.into();
        self
    }

    pub async fn merge(&self, session_id: &str) -> MergeResult<MergeReport> {
        let fragments = self.chunks.list(session_id).await?;
        let Some(first) = fragments.first() else {
            return Err(MergeError::NoFragments {
                session_id: session_id.to_string(),
            });
        };
        if first.index != 0 {
            return Err(MergeError::MissingHeader {
                session_id: session_id.to_string(),
                detail: format!("fragment 0 never arrived (first stored index is {})", first.index),
            });
        }
        let container = sniff_fragment(first).await?.ok_or_else(|| MergeError::MissingHeader {
            session_id: session_id.to_string(),
            detail: "fragment 0 does not start with a WebM/Matroska or MP4 header".into(),
        })?;

        let indices: Vec<u64> = fragments.iter().map(|f| f.index).collect();
        let missing = find_gaps(&indices);
        if !missing.is_empty() {
            match self.gap_policy {
                GapPolicy::Reject => {
                    return Err(MergeError::GapDetected {
                        session_id: session_id.to_string(),
                        missing,
                    })
                }
                GapPolicy::BestEffort => {
                    warn!(session_id, missing = ?missing, "merging around missing fragments");
                }
            }
        }

        let merged_path = self
            .chunks
            .session_dir(session_id)
            .join(format!("{}.{}", self.file_stem, container.extension()));
        let bytes = concatenate(&fragments, &merged_path).await?;

        let probe = self.probe.probe(&merged_path).await?;
        if probe.video_streams == 0 {
            return Err(MergeError::NoVideoStream { path: merged_path });
        }
        info!(
            session_id,
            fragments = fragments.len(),
            bytes,
            duration = ?probe.duration_seconds,
            "fragments merged"
        );
        Ok(MergeReport {
            session_id: session_id.to_string(),
            merged_path,
            container,
            fragment_count: fragments.len(),
            bytes,
            missing_indices: missing,
            probe,
        })
    }
}

async fn sniff_fragment(fragment: &StoredFragment) -> MergeResult<Option<ContainerKind>> {
    let io = |source| MergeError::Io {
        path: fragment.path.clone(),
        source,
    };
    let mut file = File::open(&fragment.path).await.map_err(io)?;
    let mut head = [0u8; 8];
    let mut filled = 0;
    while filled < head.len() {
        let read = file.read(&mut head[filled..]).await.map_err(io)?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(ContainerKind::sniff(&head[..filled]))
}

/// Writes `fragments` back to back into `target` through a temporary file.
async fn concatenate(fragments: &[StoredFragment], target: &Path) -> MergeResult<u64> {
    let partial = target.with_extension("partial");
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| MergeError::Io { path, source }
    };
    let mut out = File::create(&partial).await.map_err(io(&partial))?;
    let mut bytes = 0u64;
    for fragment in fragments {
        let mut input = File::open(&fragment.path).await.map_err(io(&fragment.path))?;
        bytes += tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(io(&fragment.path))?;
    }
    out.flush().await.map_err(io(&partial))?;
    out.sync_all().await.map_err(io(&partial))?;
    drop(out);
    fs::rename(&partial, target).await.map_err(io(target))?;
    Ok(bytes)
}
