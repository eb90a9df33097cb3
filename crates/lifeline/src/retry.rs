//! Bounded retries for best-effort remote writes.
//!
//! Attempt `n` that fails is followed by a pause of `n * base_delay`.
//! Failure is reported in the returned outcome, never as an error, so
//! callers can warn and move on.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Error;
use crate::remote::{RemoteRecord, RemoteStore};

/// Result of a retried write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// Whether some attempt succeeded.
    pub success: bool,
    /// Attempts made.
    pub attempts: u32,
    /// Error from the last failed attempt.
    pub last_error: Option<String>,
}

/// Remote writer with linear backoff.
pub struct RetryableWriter {
    remote: Arc<dyn RemoteStore>,
    max_attempts: u32,
    base_delay: Duration,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for RetryableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryableWriter")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryableWriter {
    /// Create a writer.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        max_attempts: u32,
        base_delay: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            max_attempts,
            base_delay,
            attempt_timeout,
        }
    }

    /// Write `record` with the configured attempt limit.
    pub async fn create(&self, record: &RemoteRecord) -> WriteOutcome {
        self.create_with_retry(record, self.max_attempts).await
    }

    /// Write `record`, trying at most `max_attempts` times (at least once).
    pub async fn create_with_retry(&self, record: &RemoteRecord, max_attempts: u32) -> WriteOutcome {
        let max_attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let result = match tokio::time::timeout(self.attempt_timeout, self.remote.insert(record)).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!("{} write", record.kind()))),
            };

            match result {
                Ok(()) => {
                    debug!(kind = record.kind(), attempt, "Remote write succeeded");
                    return WriteOutcome {
                        success: true,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Err(e) => {
                    warn!(kind = record.kind(), attempt, max_attempts, error = %e, "Remote write failed");
                    last_error = Some(e.to_string());
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.base_delay * attempt).await;
            }
        }

        WriteOutcome {
            success: false,
            attempts: max_attempts,
            last_error,
        }
    }
}
