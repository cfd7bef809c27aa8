//! Error taxonomy and retry mechanism
//!
//! Stage errors are recorded on the owning job rather than propagated to the
//! dispatch loop; one job's failure never affects another job or the loop.
//! Retry-with-backoff lives here as a single shared utility consumed by the
//! media source and storage sink implementations. The scheduler itself never
//! retries a stage.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors surfaced by the scheduler and its pipeline stages
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum JobError {
    /// Malformed request, rejected at submission; no job is created
    #[error("validation error: {0}")]
    Validation(String),

    /// Backpressure: the pending queue is at capacity
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Unknown job id
    #[error("job not found: {0}")]
    NotFound(String),

    /// Asset does not exist or access was denied
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Network failure, size mismatch, or corrupt payload during fetch
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Clip extraction stage failure
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Merge stage failure
    #[error("merge error: {0}")]
    Merge(String),

    /// Storage persistence stage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// User-initiated cancellation
    #[error("job cancelled")]
    Cancelled,

    /// Unexpected internal fault
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classification consumed by [`run_with_retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for JobError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::Storage(_))
    }
}

/// Retry strategy: capped attempts with jittered exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Cap applied after exponentiation
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomized in either direction (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// No retries at all; useful in tests and for non-idempotent operations.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay_ms = self.base_delay.as_millis() as f64 * exp;
        delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        if self.jitter_factor > 0.0 {
            let jitter = delay_ms * self.jitter_factor * (rand::random::<f64>() - 0.5);
            delay_ms = (delay_ms + jitter).max(0.0);
        }

        Duration::from_millis(delay_ms as u64)
    }
}

/// Run `op` up to `policy.max_attempts` times, backing off between attempts.
///
/// Non-retryable errors short-circuit immediately. `label` names the
/// operation in log output.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(error);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed on attempt {}/{}: {} (retrying in {:?})",
                    label, attempt, max_attempts, error, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&fast_policy(), "test-op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(TestError { retryable: true })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = run_with_retry(&fast_policy(), "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { retryable: false }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = run_with_retry(&fast_policy(), "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { retryable: true }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        // Capped at max_delay
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(4), Duration::from_millis(300));
    }

    #[test]
    fn test_job_error_classification() {
        assert!(JobError::Transfer("timeout".into()).is_retryable());
        assert!(JobError::Storage("503".into()).is_retryable());
        assert!(!JobError::Validation("bad".into()).is_retryable());
        assert!(!JobError::Cancelled.is_retryable());
        assert!(!JobError::QueueFull { capacity: 10 }.is_retryable());
    }
}
