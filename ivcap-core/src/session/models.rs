use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::error::SessionError;

/// Lifecycle of a recording. Stages only move forward; `ready` and `failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Recording,
    Draining,
    Merging,
    Transcoding,
    Ready,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Draining => "draining",
            SessionStatus::Merging => "merging",
            SessionStatus::Transcoding => "transcoding",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Failed)
    }

    /// Position along the happy path. `failed` sits off the path.
    fn rank(&self) -> Option<u8> {
        match self {
            SessionStatus::Recording => Some(0),
            SessionStatus::Draining => Some(1),
            SessionStatus::Merging => Some(2),
            SessionStatus::Transcoding => Some(3),
            SessionStatus::Ready => Some(4),
            SessionStatus::Failed => None,
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(_), None) => matches!(
                self,
                SessionStatus::Draining | SessionStatus::Merging | SessionStatus::Transcoding
            ),
            (Some(current), Some(target)) => target == current + 1,
            (None, _) => false,
        }
    }

    /// True when `next` is this stage or one already passed, so advancing to
    /// it changes nothing.
    pub fn has_reached(&self, next: SessionStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target <= current,
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recording" => Ok(Self::Recording),
            "draining" => Ok(Self::Draining),
            "merging" => Ok(Self::Merging),
            "transcoding" => Ok(Self::Transcoding),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(SessionError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub playback_url: Option<String>,
    pub segment_count: u32,
    pub duration_s: Option<f64>,
    pub fragments_received: u64,
    pub failed_fragments: u64,
    pub failure_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let status = status.parse().map_err(|err: SessionError| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        Ok(Self {
            session_id: row.get("session_id")?,
            user_id: row.get("user_id")?,
            status,
            playback_url: row.get("playback_url")?,
            segment_count: row.get("segment_count")?,
            duration_s: row.get("duration_s")?,
            fragments_received: row.get::<_, i64>("fragments_received")?.max(0) as u64,
            failed_fragments: row.get::<_, i64>("failed_fragments")?.max(0) as u64,
            failure_reason: row.get("failure_reason")?,
            created_at: parse_timestamp(row.get("created_at")?),
            updated_at: parse_timestamp(row.get("updated_at")?),
        })
    }
}

pub(crate) fn parse_timestamp(value: Option<chrono::NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}
