//! Tunables shared by every backend.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, SessionError};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Expiry refreshed on every create and append. `None` keeps sessions forever.
    pub ttl: Option<Duration>,
    /// Upper bound for a single backend call.
    pub timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ttl: Some(DEFAULT_TTL),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl StoreOptions {
    /// `0` disables expiry.
    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ttl_chrono(&self) -> Option<chrono::Duration> {
        self.ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
    }

    /// Run `fut`, reporting an overrun as a connection failure.
    pub async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::timed_out(operation, self.timeout)),
        }
    }
}
