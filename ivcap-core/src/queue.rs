use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::sqlite::{open_configured, open_flags};

const JOB_SCHEMA: &str = include_str!("../../sql/jobs.sql");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open job database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on job database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("job queue path not configured")]
    MissingStore,
    #[error("invalid job status: {0}")]
    InvalidStatus(String),
    #[error("job not found: {0}")]
    NotFound(i64),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// Payload of a transcode job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub session_id: String,
    pub user_id: String,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub session_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub failure_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            user_id: row.get("user_id")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(JobStatus::Queued),
            progress: row.get::<_, i64>("progress")?.clamp(0, 100) as u8,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            failure_reason: row.get("failure_reason")?,
            created_at: parse_timestamp(row.get("created_at")?)?,
            updated_at: parse_timestamp(row.get("updated_at")?)?,
            started_at: parse_timestamp(row.get("started_at")?)?,
            finished_at: parse_timestamp(row.get("finished_at")?)?,
        })
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued(i64),
    /// An active job for the session already existed.
    Duplicate(i64),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDisposition {
    Requeued,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobSummary {
    pub counts: HashMap<JobStatus, i64>,
}

impl JobSummary {
    pub fn count(&self, status: JobStatus) -> i64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct JobQueueStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for JobQueueStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl JobQueueStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> QueueResult<JobQueueStore> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        Ok(JobQueueStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

#[derive(Debug, Clone)]
pub struct JobQueueStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl JobQueueStore {
    pub fn builder() -> JobQueueStoreBuilder {
        JobQueueStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        JobQueueStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> QueueResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> QueueResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(JOB_SCHEMA)?;
        Ok(())
    }

    /// Adds a job unless the session already has one queued or running.
    pub fn enqueue(&self, request: &JobRequest) -> QueueResult<EnqueueOutcome> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(id) = active_job_id(&tx, &request.session_id)? {
            tx.commit()?;
            info!(session_id = %request.session_id, job_id = id, "transcode job already active");
            return Ok(EnqueueOutcome::Duplicate(id));
        }
        tx.execute(
            "INSERT INTO transcode_jobs (session_id, user_id, status, max_attempts)
             VALUES (?1, ?2, 'queued', ?3)",
            params![&request.session_id, &request.user_id, request.max_attempts.max(1)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        info!(session_id = %request.session_id, job_id = id, "transcode job enqueued");
        Ok(EnqueueOutcome::Enqueued(id))
    }

    /// Takes the oldest queued job and marks it running, counting the attempt.
    pub fn claim_next(&self) -> QueueResult<Option<Job>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM transcode_jobs WHERE status = 'queued'
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            tx.commit()?;
            return Ok(None);
        };
        tx.execute(
            "UPDATE transcode_jobs SET status = 'running', attempts = attempts + 1, progress = 0,
                started_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            [id],
        )?;
        let job = load(&tx, id)?.ok_or(QueueError::NotFound(id))?;
        tx.commit()?;
        Ok(Some(job))
    }

    pub fn update_progress(&self, id: i64, progress: u8) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET progress = MAX(progress, ?1), updated_at = CURRENT_TIMESTAMP
             WHERE id = ?2 AND status = 'running'",
            params![progress.min(100), id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    pub fn complete(&self, id: i64) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET status = 'completed', progress = 100, failure_reason = NULL,
                finished_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            [id],
        )?;
        if affected == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    /// Records a failed attempt. A retryable failure sends the job back to
    /// `queued` while it has attempts left; anything else fails it for good.
    pub fn fail(&self, id: i64, reason: &str, retryable: bool) -> QueueResult<JobDisposition> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = load(&tx, id)?.ok_or(QueueError::NotFound(id))?;
        let disposition = if retryable && job.attempts < job.max_attempts {
            tx.execute(
                "UPDATE transcode_jobs SET status = 'queued', progress = 0, failure_reason = ?1,
                    updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![reason, id],
            )?;
            JobDisposition::Requeued
        } else {
            tx.execute(
                "UPDATE transcode_jobs SET status = 'failed', failure_reason = ?1,
                    finished_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![reason, id],
            )?;
            JobDisposition::Failed
        };
        tx.commit()?;
        warn!(
            job_id = id,
            session_id = %job.session_id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            ?disposition,
            reason,
            "transcode attempt failed"
        );
        Ok(disposition)
    }

    /// Returns jobs left `running` by a previous process to the queue.
    pub fn recover_running(&self) -> QueueResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET status = 'queued', progress = 0,
                failure_reason = 'interrupted by restart', updated_at = CURRENT_TIMESTAMP
             WHERE status = 'running'",
            [],
        )?;
        if affected > 0 {
            warn!(jobs = affected, "recovered interrupted transcode jobs");
        }
        Ok(affected)
    }

    pub fn fetch(&self, id: i64) -> QueueResult<Option<Job>> {
        let conn = self.open()?;
        load(&conn, id)
    }

    pub fn active_for_session(&self, session_id: &str) -> QueueResult<Option<Job>> {
        let conn = self.open()?;
        match active_job_id(&conn, session_id)? {
            Some(id) => load(&conn, id),
            None => Ok(None),
        }
    }

    pub fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM transcode_jobs");
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(session_id) = &filter.session_id {
            clauses.push("session_id = ?");
            params.push(Value::Text(session_id.clone()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(Job::from_row(row)?);
        }
        Ok(jobs)
    }

    pub fn summary(&self) -> QueueResult<JobSummary> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM transcode_jobs GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            counts.insert(status.parse()?, row.get(1)?);
        }
        Ok(JobSummary { counts })
    }

    /// Deletes completed and failed jobs that finished before `older_than` ago.
    pub fn cleanup_finished(&self, older_than: Duration) -> QueueResult<usize> {
        let conn = self.open()?;
        let cutoff = (Utc::now() - older_than).naive_utc();
        let affected = conn.execute(
            "DELETE FROM transcode_jobs WHERE status IN ('completed', 'failed')
             AND finished_at IS NOT NULL AND finished_at < ?1",
            [cutoff],
        )?;
        Ok(affected)
    }
}

fn active_job_id(conn: &Connection, session_id: &str) -> QueueResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM transcode_jobs WHERE session_id = ?1 AND status IN ('queued', 'running')",
            [session_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn load(conn: &Connection, id: i64) -> QueueResult<Option<Job>> {
    Ok(conn
        .query_row("SELECT * FROM transcode_jobs WHERE id = ?1", [id], Job::from_row)
        .optional()?)
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}
