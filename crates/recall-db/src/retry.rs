//! Bounded retry with exponential backoff and a per-call deadline.
//!
//! Only [`BackendError::Unavailable`] is retried. The deadline bounds the
//! whole call, backoff sleeps included. Reads are abandoned the moment the
//! deadline passes. Writes are only checked against the deadline before an
//! attempt is issued: once a write is in flight it runs to completion, so a
//! write is never left half-applied by a timeout on our side.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{BackendError, StoreError};

/// Default number of attempts per call.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry, in milliseconds.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 50;

/// Default ceiling on the delay between retries, in milliseconds.
const DEFAULT_MAX_BACKOFF_MS: u64 = 1_000;

/// Default deadline for one store call, in seconds.
const DEFAULT_DEADLINE_SECS: u64 = 5;

/// How hard a store tries before surfacing a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub initial_backoff: Duration,
    /// Ceiling on the delay between retries.
    pub max_backoff: Duration,
    /// Deadline for the whole call.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Cancel,
    Complete,
}

impl RetryPolicy {
    /// Set the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run a read, cancelling it if the deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when every attempt failed
    /// transiently, [`StoreError::DeadlineExceeded`] when time ran out, or
    /// [`StoreError::Backend`] on the first non-transient failure.
    pub async fn read<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.run(operation, InFlight::Cancel, call).await
    }

    /// Run a write. An attempt that has been issued is never cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`RetryPolicy::read`], except that the deadline is only
    /// checked before each attempt.
    pub async fn write<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.run(operation, InFlight::Complete, call).await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        in_flight: InFlight,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let started = Instant::now();
        let deadline_at = started.checked_add(self.deadline);
        let expired = || deadline_at.is_some_and(|at| Instant::now() >= at);
        let deadline_error = StoreError::DeadlineExceeded {
            operation,
            deadline: self.deadline,
        };
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            if expired() {
                return Err(deadline_error);
            }

            let outcome = match (in_flight, deadline_at) {
                (InFlight::Cancel, Some(at)) => {
                    match tokio::time::timeout_at(at, call()).await {
                        Ok(outcome) => outcome,
                        Err(_elapsed) => {
                            tracing::warn!(operation, attempt, "store read hit its deadline");
                            return Err(deadline_error);
                        }
                    }
                }
                _ => call().await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "store call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(StoreError::Backend {
                    operation,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(StoreError::Transient {
                    operation,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff(attempt);
            let wakes_at = Instant::now().checked_add(delay);
            if let (Some(wake), Some(at)) = (wakes_at, deadline_at) {
                if wake >= at {
                    return Err(StoreError::Transient {
                        operation,
                        attempts: attempt,
                        source: err,
                    });
                }
            }

            tracing::warn!(
                operation,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient backend failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
            .with_deadline(Duration::from_secs(2))
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(64), Duration::from_millis(35));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .read("test.read", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Unavailable("blip".to_owned()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = fast_policy()
            .with_max_attempts(2)
            .read("test.read", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Unavailable("down".to_owned()))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(matches!(err, StoreError::Transient { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = fast_policy()
            .write("test.write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Rejected("bad table".to_owned()))
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_read_is_cancelled_at_deadline() {
        let policy = fast_policy().with_deadline(Duration::from_millis(20));
        let result: Result<(), StoreError> = policy
            .read("test.read", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn issued_write_runs_to_completion() {
        let policy = fast_policy().with_deadline(Duration::from_millis(20));
        let result = policy
            .write("test.write", || async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok("written")
            })
            .await;

        assert_eq!(result.unwrap(), "written");
    }
}
