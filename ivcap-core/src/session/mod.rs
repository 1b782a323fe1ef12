//! Persisted per-session state read by the rest of the application.

mod error;
mod models;
mod store;

pub use error::{SessionError, SessionResult};
pub use models::{Session, SessionFilter, SessionStatus};
pub use store::{SqliteSessionStore, SqliteSessionStoreBuilder};
