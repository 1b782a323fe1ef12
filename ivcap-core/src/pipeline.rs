//! Merge → transcode for one finalized session, with state written back.

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::chunk_store::ChunkStore;
use crate::merger::{MergeError, Merger};
use crate::session::{SessionError, SessionStatus, SqliteSessionStore};
use crate::transcoder::{TranscodeError, Transcoder};

pub const PROGRESS_STARTED: u8 = 10;
pub const PROGRESS_MERGED: u8 = 20;
pub const PROGRESS_TRANSCODED: u8 = 90;
pub const PROGRESS_DONE: u8 = 100;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session {session_id} is {status}; finalize it before processing")]
    NotFinalized {
        session_id: String,
        status: SessionStatus,
    },
    #[error("session state error: {0}")]
    Session(#[from] SessionError),
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("transcode failed: {0}")]
    Transcode(#[from] TranscodeError),
}

impl PipelineError {
    /// Whether running the same job again could succeed. Broken input
    /// (missing header, gaps under the reject policy, no video) cannot.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::NotFinalized { .. } => false,
            PipelineError::Session(err) => matches!(
                err,
                SessionError::Open { .. } | SessionError::Execute(_) | SessionError::Io(_)
            ),
            PipelineError::Merge(err) => matches!(
                err,
                MergeError::Io { .. } | MergeError::Probe { .. } | MergeError::Chunks(_)
            ),
            PipelineError::Transcode(_) => true,
        }
    }
}

/// Receives the milestones of a run (10, 20, 90, 100).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: u8);
}

impl<F> ProgressReporter for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        self(percent)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub session_id: String,
    pub playback_url: Option<String>,
    pub segment_count: u32,
    pub total_duration: Option<f64>,
    pub fragments_merged: usize,
    pub missing_indices: Vec<u64>,
    /// The session was already ready; nothing ran.
    pub skipped: bool,
}

/// Everything one pipeline run needs, passed explicitly to workers.
pub struct PipelineContext {
    pub sessions: SqliteSessionStore,
    pub chunks: ChunkStore,
    pub merger: Merger,
    pub transcoder: Transcoder,
}

impl PipelineContext {
    pub async fn run(
        &self,
        session_id: &str,
        progress: &dyn ProgressReporter,
    ) -> PipelineResult<PipelineReport> {
        let session = self.sessions.get(session_id)?;
        match session.status {
            SessionStatus::Ready => {
                info!(session_id, "session already ready; skipping pipeline");
                progress.report(PROGRESS_DONE);
                return Ok(PipelineReport {
                    session_id: session.session_id,
                    playback_url: session.playback_url,
                    segment_count: session.segment_count,
                    total_duration: session.duration_s,
                    fragments_merged: 0,
                    missing_indices: Vec::new(),
                    skipped: true,
                });
            }
            SessionStatus::Recording | SessionStatus::Failed => {
                return Err(PipelineError::NotFinalized {
                    session_id: session.session_id,
                    status: session.status,
                })
            }
            _ => {}
        }

        progress.report(PROGRESS_STARTED);
        self.sessions.advance(session_id, SessionStatus::Merging)?;
        let merged = self.merger.merge(session_id).await?;
        progress.report(PROGRESS_MERGED);

        self.sessions.advance(session_id, SessionStatus::Transcoding)?;
        let outcome = self
            .transcoder
            .transcode(session_id, &merged.merged_path, merged.probe.duration_seconds)
            .await?;
        progress.report(PROGRESS_TRANSCODED);

        let segment_count = outcome.segment_count() as u32;
        self.sessions.mark_ready(
            session_id,
            &outcome.playback_url,
            segment_count,
            outcome.total_duration,
        )?;
        if let Err(err) = self.chunks.remove_session(session_id).await {
            warn!(session_id, error = %err, "failed to clean staging area");
        }
        progress.report(PROGRESS_DONE);

        info!(
            session_id,
            segments = segment_count,
            fragments = merged.fragment_count,
            missing = merged.missing_indices.len(),
            "pipeline complete"
        );
        Ok(PipelineReport {
            session_id: session_id.to_string(),
            playback_url: Some(outcome.playback_url),
            segment_count,
            total_duration: Some(outcome.total_duration),
            fragments_merged: merged.fragment_count,
            missing_indices: merged.missing_indices,
            skipped: false,
        })
    }
}
