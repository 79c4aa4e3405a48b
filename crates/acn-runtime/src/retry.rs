//! Bounded retry with linear backoff.
//!
//! Remote connections get a fixed budget of attempts. After a failed
//! attempt `n` (0-indexed) the caller sleeps `(2n + 1)` backoff units, so
//! with the default one-second unit the waits are 1 s, 3 s, 5 s and so on.
//! Waiting stops early when the surrounding connection is shutting down.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Base unit of the linear backoff.
    pub backoff_unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// All retries exhausted, a non-retryable error occurred, or the wait
    /// was cancelled.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success { result, .. } => Ok(result),
            Self::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Delay after the failed attempt `attempt` (0-indexed): `unit * (2 * attempt + 1)`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    config
        .backoff_unit
        .saturating_mul(attempt.saturating_mul(2).saturating_add(1))
}

// ---------------------------------------------------------------------------
// Core retry function
// ---------------------------------------------------------------------------

/// Execute an async operation with retry.
///
/// `should_retry` decides whether an error is worth another attempt. No
/// further attempt starts once `cancel` fires; the last error is returned
/// instead.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempt = attempt + 1,
                        "retry succeeded after {} previous failures", attempt
                    );
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => err,
        };

        let attempts = attempt + 1;
        if !should_retry(&err) {
            debug!(attempt = attempts, error = %err, "error is not retryable, giving up");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts,
            };
        }
        if attempts >= max {
            warn!(attempt = attempts, max_attempts = max, error = %err, "all retry attempts exhausted");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts,
            };
        }

        let delay = compute_backoff(config, attempt);
        debug!(attempt = attempts, ?delay, error = %err, "retrying after error");
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(attempt = attempts, "retry cancelled");
                return RetryOutcome::Exhausted {
                    last_error: err,
                    attempts,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
