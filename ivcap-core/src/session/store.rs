use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use super::error::{SessionError, SessionResult};
use super::models::{Session, SessionFilter, SessionStatus};
use crate::sqlite::{open_configured, open_flags};

const SESSION_SCHEMA: &str = include_str!("../../../sql/sessions.sql");

#[derive(Debug, Clone)]
pub struct SqliteSessionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionStoreBuilder {
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

    pub fn build(self) -> SessionResult<SqliteSessionStore> {
        let path = self.path.ok_or(SessionError::MissingStore)?;
        Ok(SqliteSessionStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

/// Persisted session state. Every call opens its own connection, so the
/// store is cheap to clone into handlers and workers.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSessionStore {
    pub fn builder() -> SqliteSessionStoreBuilder {
        SqliteSessionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SessionResult<Self> {
        SqliteSessionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> SessionResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| SessionError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> SessionResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    /// Creates the session in `recording`. Repeating the call for the same
    /// owner returns the existing row.
    pub fn create(&self, session_id: &str, user_id: &str) -> SessionResult<Session> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, user_id, status) VALUES (?1, ?2, 'recording')",
            params![session_id, user_id],
        )?;
        let session = load(&conn, session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(SessionError::OwnerMismatch {
                session_id: session_id.to_string(),
            });
        }
        if inserted > 0 {
            info!(session_id, user_id, "session created");
        }
        Ok(session)
    }

    pub fn fetch(&self, session_id: &str) -> SessionResult<Option<Session>> {
        let conn = self.open()?;
        load(&conn, session_id)
    }

    pub fn get(&self, session_id: &str) -> SessionResult<Session> {
        self.fetch(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Runs `store` under the session's write lock and counts the fragment
    /// it stored. No stage change can interleave, so a fragment either lands
    /// before merging starts or is rejected without touching disk. `store`
    /// reports whether it replaced an earlier copy; replacements are not
    /// counted twice.
    pub fn record_fragment<T, E, F>(&self, session_id: &str, store: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<(T, bool), E>,
        E: From<SessionError>,
    {
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(SessionError::from)?;
        let session = load(&tx, session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if !matches!(
            session.status,
            SessionStatus::Recording | SessionStatus::Draining
        ) {
            return Err(SessionError::NotAcceptingFragments {
                session_id: session.session_id,
                status: session.status,
            }
            .into());
        }
        let (stored, replaced) = store()?;
        if !replaced {
            tx.execute(
                "UPDATE sessions SET fragments_received = fragments_received + 1,
                    updated_at = CURRENT_TIMESTAMP WHERE session_id = ?1",
                [session_id],
            )
            .map_err(SessionError::from)?;
        }
        tx.commit().map_err(SessionError::from)?;
        Ok(stored)
    }

    /// `recording -> draining`, recording how many fragments the client gave
    /// up on. Sessions already past recording are returned unchanged.
    pub fn begin_draining(&self, session_id: &str, failed_fragments: u64) -> SessionResult<Session> {
        self.with_session(session_id, |conn, session| {
            if session.status != SessionStatus::Recording {
                debug!(session_id, status = %session.status, "session already draining or beyond");
                return Ok(session);
            }
            conn.execute(
                "UPDATE sessions SET status = 'draining', failed_fragments = ?1,
                    updated_at = CURRENT_TIMESTAMP WHERE session_id = ?2",
                params![failed_fragments as i64, session_id],
            )?;
            info!(session_id, failed_fragments, "session draining");
            reload(conn, session_id)
        })
    }

    /// Moves the session forward one stage. Asking for a stage the session
    /// already occupies or has passed is a no-op, which keeps queue retries
    /// from moving a session backwards.
    pub fn advance(&self, session_id: &str, next: SessionStatus) -> SessionResult<Session> {
        self.with_session(session_id, |conn, session| {
            let current = session.status;
            if current == next || (!current.is_terminal() && current.has_reached(next)) {
                return Ok(session);
            }
            if !current.can_transition_to(next) {
                return Err(SessionError::InvalidTransition {
                    session_id: session.session_id,
                    from: current,
                    to: next,
                });
            }
            conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE session_id = ?2",
                params![next.as_str(), session_id],
            )?;
            debug!(session_id, from = %current, to = %next, "session advanced");
            reload(conn, session_id)
        })
    }

    pub fn mark_ready(
        &self,
        session_id: &str,
        playback_url: &str,
        segment_count: u32,
        duration_s: f64,
    ) -> SessionResult<Session> {
        self.with_session(session_id, |conn, session| {
            if session.status == SessionStatus::Ready {
                return Ok(session);
            }
            if !session.status.can_transition_to(SessionStatus::Ready) {
                return Err(SessionError::InvalidTransition {
                    session_id: session.session_id,
                    from: session.status,
                    to: SessionStatus::Ready,
                });
            }
            conn.execute(
                "UPDATE sessions SET status = 'ready', playback_url = ?1, segment_count = ?2,
                    duration_s = ?3, failure_reason = NULL, updated_at = CURRENT_TIMESTAMP
                 WHERE session_id = ?4",
                params![playback_url, segment_count, duration_s, session_id],
            )?;
            info!(session_id, playback_url, segment_count, "session ready");
            reload(conn, session_id)
        })
    }

    pub fn mark_failed(&self, session_id: &str, reason: &str) -> SessionResult<Session> {
        self.with_session(session_id, |conn, session| {
            if session.status == SessionStatus::Failed {
                return Ok(session);
            }
            if !session.status.can_transition_to(SessionStatus::Failed) {
                return Err(SessionError::InvalidTransition {
                    session_id: session.session_id,
                    from: session.status,
                    to: SessionStatus::Failed,
                });
            }
            conn.execute(
                "UPDATE sessions SET status = 'failed', failure_reason = ?1,
                    updated_at = CURRENT_TIMESTAMP WHERE session_id = ?2",
                params![reason, session_id],
            )?;
            warn!(session_id, reason, "session failed");
            reload(conn, session_id)
        })
    }

    pub fn list(&self, filter: &SessionFilter) -> SessionResult<Vec<Session>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM sessions");
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(user_id) = &filter.user_id {
            clauses.push("user_id = ?");
            params.push(Value::Text(user_id.clone()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY created_at DESC, session_id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(Session::from_row(row)?);
        }
        Ok(sessions)
    }

    pub fn counts(&self) -> SessionResult<HashMap<SessionStatus, i64>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sessions GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            counts.insert(status.parse()?, row.get(1)?);
        }
        Ok(counts)
    }

    fn with_session<T, F>(&self, session_id: &str, operation: F) -> SessionResult<T>
    where
        F: FnOnce(&Connection, Session) -> SessionResult<T>,
    {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let session = load(&tx, session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let result = operation(&tx, session)?;
        tx.commit()?;
        Ok(result)
    }
}

fn load(conn: &Connection, session_id: &str) -> SessionResult<Option<Session>> {
    Ok(conn
        .query_row(
            "SELECT * FROM sessions WHERE session_id = ?1",
            [session_id],
            Session::from_row,
        )
        .optional()?)
}

fn reload(conn: &Connection, session_id: &str) -> SessionResult<Session> {
    load(conn, session_id)?.ok_or_else(|| SessionError::NotFound(session_id.to_string()))
}
