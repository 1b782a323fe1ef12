use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// One timed slice of a recording. Only index 0 carries the container header.
#[derive(Clone, PartialEq, Eq)]
pub struct Fragment {
    pub session_id: String,
    pub index: u64,
    pub payload: Bytes,
}

impl Fragment {
    pub fn new(session_id: impl Into<String>, index: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            session_id: session_id.into(),
            index,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("session_id", &self.session_id)
            .field("index", &self.index)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// Acknowledgement returned by the chunk store for a persisted fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentAck {
    pub session_id: String,
    pub index: u64,
    pub bytes: u64,
    /// True when an earlier copy of the same index was overwritten.
    pub replaced: bool,
}

#[derive(Debug, Error)]
#[error("fragment sink closed; fragment {index} of session {session_id} was not accepted")]
pub struct SinkClosed {
    pub session_id: String,
    pub index: u64,
}

/// Receives fragments from the recorder without blocking it.
pub trait FragmentSink: Send + Sync {
    fn submit(&self, fragment: Fragment) -> Result<(), SinkClosed>;
}

impl FragmentSink for mpsc::UnboundedSender<Fragment> {
    fn submit(&self, fragment: Fragment) -> Result<(), SinkClosed> {
        self.send(fragment).map_err(|err| SinkClosed {
            session_id: err.0.session_id,
            index: err.0.index,
        })
    }
}
