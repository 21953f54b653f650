//! Error taxonomy shared by the registry and every session backend.

use std::time::Duration;

/// Result alias used across the session subsystem.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the registry and the session storage contract.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Deployment mistake: unknown scheme, malformed URI, bad registry entry.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backing store could not be reached or did not answer in time.
    #[error("session store unavailable: {0}")]
    Connection(String),

    /// Malformed event or corrupted stored document.
    #[error("validation error: {0}")]
    Validation(String),

    /// The session addressed by a write no longer exists.
    #[error("session not found: {app_name}/{user_id}/{session_id}")]
    NotFound {
        app_name: String,
        user_id: String,
        session_id: String,
    },

    /// A session with the requested id already exists.
    #[error("session already exists: {app_name}/{user_id}/{session_id}")]
    Conflict {
        app_name: String,
        user_id: String,
        session_id: String,
    },
}

impl SessionError {
    /// Timed-out backend calls are reported exactly like unreachable stores.
    pub fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Connection(format!(
            "{operation} timed out after {}ms",
            after.as_millis()
        ))
    }

    /// True when the caller should present a "session unavailable" condition.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("malformed session document: {err}"))
    }
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::TypeError {
            return Self::Validation(format!("unexpected redis reply: {err}"));
        }
        Self::Connection(format!("redis: {err}"))
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Connection(format!("sqlite: {err}"))
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Connection(format!("storage task failed: {err}"))
    }
}
