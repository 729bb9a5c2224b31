//! Backoff, transient retry, and the shared polling helper.
//!
//! Every wait in the engines goes through one of two helpers:
//! [`retry_transient`] around a single provider call and [`poll_until`] for
//! "is it ready / is it free" loops.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ErrorClass, ProviderError, ProviderResult};

use super::context::CancelSignal;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl BackoffPolicy {
    /// Creates a policy growing from `initial` by `multiplier`, capped at `max`.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// A policy that always waits `interval`.
    #[must_use]
    pub const fn constant(interval: Duration) -> Self {
        Self::new(interval, interval, 1.0)
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(scaled).map_or(self.max, |d| d.min(self.max))
    }
}

/// Bounded retry of transient provider errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

/// Bounded polling.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Maximum number of predicate evaluations.
    pub attempts: u32,
    /// Delay between evaluations.
    pub backoff: BackoffPolicy,
}

/// Result of a retried call.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: ProviderResult<T>,
    /// Number of calls made.
    pub attempts: u32,
}

/// Runs `call` until it succeeds, fails non-transiently, runs out of
/// attempts, or would overrun `deadline`.
///
/// Each call is bounded by `call_timeout`; an expired call counts as a
/// transient [`ProviderError::Timeout`]. Retries are not interrupted by
/// cancellation so an operation in flight always settles.
pub async fn retry_transient<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    call_timeout: Duration,
    deadline: Instant,
    mut call: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = tokio::time::timeout(call_timeout, call())
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Timeout {
                    operation: operation.to_string(),
                    secs: call_timeout.as_secs(),
                })
            });

        let error = match result {
            Err(e) if e.class() == ErrorClass::Transient => e,
            other => return Attempted { result: other, attempts },
        };

        if attempts >= policy.max_attempts {
            warn!("{operation}: giving up after {attempts} attempts: {error}");
            return Attempted {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.backoff.delay_for(attempts - 1);
        if Instant::now() + delay >= deadline {
            warn!("{operation}: resource budget spent after {attempts} attempts: {error}");
            return Attempted {
                result: Err(error),
                attempts,
            };
        }

        debug!("{operation}: attempt {attempts} failed ({error}), retrying in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

/// How a polling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held.
    Ready {
        /// Evaluations made.
        attempts: u32,
    },
    /// All attempts were used.
    Exhausted {
        /// Evaluations made.
        attempts: u32,
    },
    /// The time budget ran out.
    TimedOut {
        /// Evaluations made.
        attempts: u32,
    },
    /// Cancellation was requested.
    Cancelled {
        /// Evaluations made.
        attempts: u32,
    },
}

impl PollOutcome {
    /// Whether the predicate held.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Evaluations made.
    #[must_use]
    pub const fn attempts(self) -> u32 {
        match self {
            Self::Ready { attempts }
            | Self::Exhausted { attempts }
            | Self::TimedOut { attempts }
            | Self::Cancelled { attempts } => attempts,
        }
    }
}

/// Evaluates `predicate` until it returns `true`, with backoff between
/// evaluations, bounded by the policy's attempts and `timeout`.
///
/// Transient predicate errors count as "not yet". Any other error ends the
/// loop and is returned. When `cancel` is given, both the wait between
/// evaluations and the loop itself stop on cancellation.
///
/// # Errors
///
/// Returns the first non-transient error raised by `predicate`.
pub async fn poll_until<F, Fut>(
    mut predicate: F,
    policy: &PollPolicy,
    timeout: Duration,
    cancel: Option<&CancelSignal>,
) -> ProviderResult<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0;

    while attempts < policy.attempts {
        if cancel.is_some_and(CancelSignal::is_cancelled) {
            return Ok(PollOutcome::Cancelled { attempts });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(PollOutcome::TimedOut { attempts });
        }

        attempts += 1;
        match tokio::time::timeout(remaining, predicate()).await {
            Ok(Ok(true)) => return Ok(PollOutcome::Ready { attempts }),
            Ok(Ok(false)) => {}
            Ok(Err(e)) if e.is_retryable() => debug!("Poll attempt {attempts} errored transiently: {e}"),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(PollOutcome::TimedOut { attempts }),
        }

        if attempts >= policy.attempts {
            break;
        }

        let delay = policy
            .backoff
            .delay_for(attempts - 1)
            .min(deadline.saturating_duration_since(Instant::now()));
        match cancel {
            Some(signal) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = signal.cancelled() => return Ok(PollOutcome::Cancelled { attempts }),
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }

    Ok(PollOutcome::Exhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 2.0),
        }
    }

    fn quick_poll(attempts: u32) -> PollPolicy {
        PollPolicy {
            attempts,
            backoff: BackoffPolicy::constant(Duration::from_millis(1)),
        }
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let out = retry_transient("create", &quick_retry(5), Duration::from_secs(1), far(), || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::transient("throttled"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(out.result, Ok(2));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal() {
        let out: Attempted<()> = retry_transient("create", &quick_retry(5), Duration::from_secs(1), far(), || async {
            Err(ProviderError::permission("denied"))
        })
        .await;
        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(ProviderError::Permission { .. })));
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let out: Attempted<()> = retry_transient("delete", &quick_retry(3), Duration::from_secs(1), far(), || async {
            Err(ProviderError::transient("503"))
        })
        .await;
        assert_eq!(out.attempts, 3);
        assert_err!(out.result);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let out: Attempted<()> = retry_transient("read", &quick_retry(2), Duration::from_millis(5), far(), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(out.attempts, 2);
        assert!(matches!(out.result, Err(ProviderError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_poll_ready_after_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = poll_until(
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n >= 2) }
            },
            &quick_poll(10),
            Duration::from_secs(5),
            None,
        )
        .await
        .expect("poll");
        assert_eq!(outcome, PollOutcome::Ready { attempts: 3 });
    }

    #[tokio::test]
    async fn test_poll_exhausts() {
        let outcome = assert_ok!(poll_until(|| async { Ok(false) }, &quick_poll(4), Duration::from_secs(5), None).await);
        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 4 });
    }

    #[tokio::test]
    async fn test_poll_treats_transient_as_not_ready_and_surfaces_fatal() {
        let outcome = poll_until(
            || async { Err(ProviderError::transient("throttled")) },
            &quick_poll(2),
            Duration::from_secs(5),
            None,
        )
        .await
        .expect("poll");
        assert!(!outcome.is_ready());

        let err = assert_err!(
            poll_until(
                || async { Err(ProviderError::permission("denied")) },
                &quick_poll(2),
                Duration::from_secs(5),
                None,
            )
            .await
        );
        assert!(matches!(err, ProviderError::Permission { .. }));
    }

    #[tokio::test]
    async fn test_poll_stops_on_cancel() {
        let cancel = CancelSignal::new();
        cancel.cancel("stop");
        let outcome = poll_until(|| async { Ok(false) }, &quick_poll(100), Duration::from_secs(5), Some(&cancel))
            .await
            .expect("poll");
        assert_eq!(outcome, PollOutcome::Cancelled { attempts: 0 });
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let policy = PollPolicy {
            attempts: 1000,
            backoff: BackoffPolicy::constant(Duration::from_millis(5)),
        };
        let outcome = poll_until(|| async { Ok(false) }, &policy, Duration::from_millis(30), None)
            .await
            .expect("poll");
        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
    }
}
