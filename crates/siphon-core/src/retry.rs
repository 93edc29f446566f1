//! Retry policy with exponential backoff.
//!
//! Both the collector uploader and the central batch writer retry failed
//! work under a [`RetryPolicy`]. The policy decides how many attempts are
//! made and how long to wait between them; what happens once it gives up
//! (spill to disk, dead-letter) is the caller's terminal action, usually a
//! [`JsonlSpill`](crate::spill::JsonlSpill).
//!
//! # Backoff curve
//!
//! The delay after failed attempt `n` (1-based) is
//! `initial_backoff * 2^(n-1)`, capped at `max_backoff`. With the defaults
//! (3 attempts, 500ms initial) the waits are 500ms and 1s.

use std::future::Future;
use std::time::Duration;

/// Default attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Classification of a failed attempt.
#[derive(Debug)]
pub enum Failure<E> {
    /// Transient (timeout, transport error, 5xx). Worth another attempt.
    Retryable(E),
    /// Permanent. Retrying cannot help.
    Fatal(E),
}

/// Result of running an operation under a policy.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded on attempt `attempts`.
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed with a retryable error; `error` is the last one.
    Exhausted { error: E, attempts: u32 },
    /// An attempt failed with a fatal error.
    Fatal { error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of attempts that were made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Attempt ceiling plus backoff curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt ceiling and default backoff.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Whether `attempts` failed attempts use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Run `op` until it succeeds, fails fatally, or the budget runs out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Failure<E>>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Err(Failure::Fatal(error)) => {
                    return RetryOutcome::Fatal {
                        error,
                        attempts: attempt,
                    };
                }
                Err(Failure::Retryable(error)) => {
                    if self.is_exhausted(attempt) {
                        return RetryOutcome::Exhausted {
                            error,
                            attempts: attempt,
                        };
                    }
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_curve_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_is_exhausted() {
        let policy = fast_policy(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn test_with_max_attempts_never_zero() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let outcome = fast_policy(3)
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Failure::Retryable("timeout"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Succeeded {
                value: 3,
                attempts: 3
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_without_extra_attempt() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), &str> = fast_policy(3)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::Retryable("503")) }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted {
                error: "503",
                attempts: 3
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), &str> = fast_policy(5)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::Fatal("400 bad request")) }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Fatal { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
