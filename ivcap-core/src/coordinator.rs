//! Server-side entry points: start, fragment arrival, finalize, poll.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chunk_store::{validate_session_id, ChunkStore, ChunkStoreError};
use crate::fragment::FragmentAck;
use crate::queue::{Job, JobFilter, JobQueueStore, JobRequest, JobStatus, QueueError};
use crate::session::{Session, SessionError, SessionStatus, SqliteSessionStore};

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Chunks(#[from] ChunkStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub user_id: String,
    #[serde(default)]
    pub failed_fragments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeOutcome {
    pub session_id: String,
    pub job_id: Option<i64>,
    /// True when this call did not create a new job.
    pub deduplicated: bool,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: i64,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            attempts: job.attempts,
        }
    }
}

/// Session as reported to pollers, with the latest transcode job if any.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub job: Option<JobView>,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    sessions: SqliteSessionStore,
    chunks: ChunkStore,
    jobs: JobQueueStore,
    max_job_attempts: u32,
}

impl Coordinator {
    pub fn new(
        sessions: SqliteSessionStore,
        chunks: ChunkStore,
        jobs: JobQueueStore,
        max_job_attempts: u32,
    ) -> Self {
        Self {
            sessions,
            chunks,
            jobs,
            max_job_attempts,
        }
    }

    pub fn sessions(&self) -> &SqliteSessionStore {
        &self.sessions
    }

    pub fn jobs(&self) -> &JobQueueStore {
        &self.jobs
    }

    pub fn create_session(&self, request: &CreateSessionRequest) -> CoordinatorResult<Session> {
        let session_id = match &request.session_id {
            Some(id) => id.clone(),
            None => Uuid::new_v4().simple().to_string(),
        };
        validate_session_id(&session_id)?;
        Ok(self.sessions.create(&session_id, &request.user_id)?)
    }

    /// Stores a fragment durably and counts it against the session. The
    /// status check, the write and the count share one session transaction,
    /// so a fragment cannot land after merging has started.
    pub async fn accept_fragment(
        &self,
        session_id: &str,
        index: u64,
        payload: Bytes,
    ) -> CoordinatorResult<FragmentAck> {
        validate_session_id(session_id)?;
        let sessions = self.sessions.clone();
        let chunks = self.chunks.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            sessions.record_fragment(&session_id, || {
                let ack = chunks.put_blocking(&session_id, index, &payload)?;
                let replaced = ack.replaced;
                CoordinatorResult::Ok((ack, replaced))
            })
        })
        .await
        .map_err(ChunkStoreError::from)?
    }

    /// Marks the recording finished and enqueues its transcode job. Repeated
    /// calls never create a second job.
    pub fn finalize(
        &self,
        session_id: &str,
        request: &FinalizeRequest,
    ) -> CoordinatorResult<FinalizeOutcome> {
        let session = self.sessions.get(session_id)?;
        if session.user_id != request.user_id {
            return Err(SessionError::OwnerMismatch {
                session_id: session_id.to_string(),
            }
            .into());
        }
        if session.status.is_terminal() {
            debug!(session_id, status = %session.status, "finalize on finished session");
            return Ok(FinalizeOutcome {
                session_id: session.session_id,
                job_id: self.latest_job(session_id)?.map(|job| job.id),
                deduplicated: true,
                status: session.status,
            });
        }

        let session = self
            .sessions
            .begin_draining(session_id, request.failed_fragments)?;
        let outcome = self.jobs.enqueue(&JobRequest {
            session_id: session_id.to_string(),
            user_id: session.user_id.clone(),
            max_attempts: self.max_job_attempts,
        })?;
        info!(
            session_id,
            job_id = outcome.job_id(),
            deduplicated = outcome.is_duplicate(),
            failed_fragments = session.failed_fragments,
            "session finalized"
        );
        Ok(FinalizeOutcome {
            session_id: session.session_id,
            job_id: Some(outcome.job_id()),
            deduplicated: outcome.is_duplicate(),
            status: session.status,
        })
    }

    pub fn status(&self, session_id: &str) -> CoordinatorResult<SessionView> {
        let session = self.sessions.get(session_id)?;
        let job = self.latest_job(session_id)?;
        Ok(SessionView {
            session,
            job: job.as_ref().map(JobView::from),
        })
    }

    fn latest_job(&self, session_id: &str) -> CoordinatorResult<Option<Job>> {
        let jobs = self.jobs.list(&JobFilter {
            session_id: Some(session_id.to_string()),
            ..JobFilter::default()
        })?;
        Ok(jobs.into_iter().last())
    }
}
