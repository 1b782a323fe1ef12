use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::models::SessionStatus;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open session database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on session database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("session store path not configured")]
    MissingStore,
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid session status: {0}")]
    InvalidStatus(String),
    #[error("session {session_id} cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("session {session_id} belongs to another user")]
    OwnerMismatch { session_id: String },
    #[error("session {session_id} is {status} and no longer accepts fragments")]
    NotAcceptingFragments {
        session_id: String,
        status: SessionStatus,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
