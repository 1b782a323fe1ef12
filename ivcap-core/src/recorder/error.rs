use thiserror::Error;

use super::state::{RecorderEvent, RecorderState};

pub type RecorderResult<T> = Result<T, RecorderError>;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("capture device failed: {0}")]
    Device(String),
    #[error("invalid recorder transition from {from} on {event}")]
    InvalidTransition {
        from: RecorderState,
        event: RecorderEvent,
    },
    #[error("recording task aborted: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for RecorderError {
    fn from(err: tokio::task::JoinError) -> Self {
        RecorderError::Task(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AudioError {
    #[error("audio source failed: {0}")]
    Source(String),
    #[error("incompatible audio formats: primary {primary}, secondary {secondary}")]
    FormatMismatch { primary: String, secondary: String },
}
