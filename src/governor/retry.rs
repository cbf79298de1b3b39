//! Bounded retry around a single unit of governed work.
//!
//! Units of work report how an attempt went through [`Attempt`] instead of using errors as
//! control flow. The executor branches on the tag:
//!
//! ```text
//! Success      -> reset shared backoff, return value
//! RateLimited  -> escalate shared backoff, retry; RateLimitExceeded when out of attempts
//! TimedOut     -> sleep retry_delay_base * 2^attempt, retry; MaxRetriesExceeded when out of attempts
//! Failed       -> return immediately, never retried
//! ```
//!
//! Every attempt first waits out the shared backoff window and then the interval pacer,
//! so the pacing floor applies to each actual remote call.

use std::future::Future;
use std::time::Duration;

use super::backoff::BackoffController;
use super::limiter::IntervalPacer;
use crate::fingerprint::RequestKey;
use crate::metrics::{GovernorMetrics, RetryReason};
use crate::safety::{GovernedError, GovernedResult, SafetyLimit};

/// Outcome of one attempt of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The remote call succeeded.
    Success(T),
    /// The remote API signalled rate limiting (HTTP 429 or a concurrency-limit error).
    RateLimited { detail: String },
    /// The remote call did not answer in time.
    TimedOut,
    /// Any other failure. Not retried.
    Failed { message: String },
}

impl<T> Attempt<T> {
    /// Returns true if this outcome should be retried while attempts remain.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Attempt::RateLimited { .. } | Attempt::TimedOut)
    }
}

/// Retry configuration for the per-call timeout curve.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Delay before retry `n` (0-based) is `retry_delay_base * 2^n`.
    pub retry_delay_base: Duration,
}

impl RetryConfig {
    /// Exponential delay after a timed-out attempt. Not capped by the backoff ceiling.
    pub fn delay_after_timeout(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.retry_delay_base.saturating_mul(factor)
    }
}

pub(crate) struct RetryExecutor<'a> {
    pub backoff: &'a BackoffController,
    pub pacer: &'a IntervalPacer,
    pub metrics: &'a GovernorMetrics,
    pub config: RetryConfig,
}

impl RetryExecutor<'_> {
    /// Run `work` up to `max_retries + 1` times.
    ///
    /// Each attempt is bounded by `timeout`. Never returns a degraded success: every
    /// non-success path ends in a populated [`GovernedError`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        key: &RequestKey,
        work: &F,
        timeout: Duration,
        max_retries: u32,
    ) -> GovernedResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut attempt: u32 = 0;
        let mut rate_limit_hits: u32 = 0;

        loop {
            self.backoff.wait().await;
            self.pacer.pace().await;

            let outcome = match tokio::time::timeout(timeout, work()).await {
                Ok(outcome) => outcome,
                Err(_) => Attempt::TimedOut,
            };
            let attempts_remain = attempt < max_retries;

            match outcome {
                Attempt::Success(value) => {
                    self.backoff.record_success();
                    if attempt > 0 {
                        tracing::info!(
                            key = %key,
                            attempts = attempt + 1,
                            "Remote call succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Attempt::RateLimited { detail } => {
                    rate_limit_hits += 1;
                    self.metrics.record_rate_limit_hit();
                    let window = self.backoff.record_rate_limit_hit();

                    if !attempts_remain {
                        return Err(SafetyLimit::rate_limit_exceeded(
                            rate_limit_hits,
                            attempt + 1,
                            self.backoff.consecutive_failures(),
                        )
                        .into());
                    }

                    self.metrics.record_retry(RetryReason::RateLimit);
                    tracing::warn!(
                        key = %key,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = window.as_millis() as u64,
                        detail = %detail,
                        "Remote call rate limited, retrying after shared backoff"
                    );
                }
                Attempt::TimedOut => {
                    if !attempts_remain {
                        return Err(SafetyLimit::max_retries_exceeded(attempt + 1, timeout).into());
                    }

                    let delay = self.config.delay_after_timeout(attempt);
                    self.metrics.record_retry(RetryReason::Timeout);
                    tracing::warn!(
                        key = %key,
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Remote call timed out, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Failed { message } => {
                    tracing::warn!(
                        key = %key,
                        attempt = attempt + 1,
                        error = %message,
                        "Remote call failed with non-retriable error, not retrying"
                    );
                    return Err(GovernedError::Remote { message });
                }
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyLimitKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    struct Fixture {
        backoff: BackoffController,
        pacer: IntervalPacer,
        metrics: GovernorMetrics,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backoff: BackoffController::new(Duration::from_secs(1), Duration::from_secs(30)),
                pacer: IntervalPacer::new(Duration::from_millis(100)),
                metrics: GovernorMetrics::new(),
            }
        }

        fn executor(&self) -> RetryExecutor<'_> {
            RetryExecutor {
                backoff: &self.backoff,
                pacer: &self.pacer,
                metrics: &self.metrics,
                config: RetryConfig {
                    retry_delay_base: Duration::from_secs(1),
                },
            }
        }
    }

    fn key() -> RequestKey {
        RequestKey::from_raw("retry-test")
    }

    #[test]
    fn test_timeout_delay_curve() {
        let config = RetryConfig {
            retry_delay_base: Duration::from_secs(1),
        };
        assert_eq!(config.delay_after_timeout(0), Duration::from_secs(1));
        assert_eq!(config.delay_after_timeout(1), Duration::from_secs(2));
        assert_eq!(config.delay_after_timeout(5), Duration::from_secs(32));
    }

    #[test]
    fn test_is_retriable() {
        assert!(Attempt::<()>::TimedOut.is_retriable());
        assert!(
            Attempt::<()>::RateLimited {
                detail: "429".to_string()
            }
            .is_retriable()
        );
        assert!(
            !Attempt::<()>::Failed {
                message: "bad".to_string()
            }
            .is_retriable()
        );
        assert!(!Attempt::Success(1).is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_rate_limit_resets_backoff() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let work = {
            let calls = calls.clone();
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Attempt::RateLimited {
                            detail: "429".to_string(),
                        }
                    } else {
                        Attempt::Success("rows")
                    }
                }
            }
        };

        let result = fixture
            .executor()
            .execute_with_retry(&key(), &work, Duration::from_secs(30), 3)
            .await;
        assert_eq!(result, Ok("rows"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.backoff.consecutive_failures(), 0);
        assert_eq!(fixture.metrics.counters().rate_limit_hits, 1);
        assert_eq!(fixture.metrics.counters().retried_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_rate_limit_exhausts_attempts() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let work = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Attempt::<()>::RateLimited {
                        detail: "429".to_string(),
                    }
                }
            }
        };

        let err = fixture
            .executor()
            .execute_with_retry(&key(), &work, Duration::from_secs(30), 2)
            .await
            .unwrap_err();
        assert_eq!(err.safety_limit(), SafetyLimitKind::RateLimitExceeded);
        assert!(err.diagnostic().contains("hits=3"));
        assert!(err.diagnostic().contains("attempts=3"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.backoff.consecutive_failures(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_exceeding_timeout_is_retried_then_fails() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let work = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Attempt::Success(())
                }
            }
        };

        let start = Instant::now();
        let err = fixture
            .executor()
            .execute_with_retry(&key(), &work, Duration::from_secs(5), 2)
            .await
            .unwrap_err();
        assert_eq!(err.safety_limit(), SafetyLimitKind::MaxRetriesExceeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 3 timeouts of 5s plus delays of 1s and 2s
        assert!(start.elapsed() >= Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_failure_returns_immediately() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let work = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Attempt::<()>::Failed {
                        message: "Invalid search query".to_string(),
                    }
                }
            }
        };

        let err = fixture
            .executor()
            .execute_with_retry(&key(), &work, Duration::from_secs(5), 5)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GovernedError::Remote {
                message: "Invalid search query".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.metrics.counters().retried_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let fixture = Fixture::new();
        let work = || async { Attempt::<()>::TimedOut };
        let err = fixture
            .executor()
            .execute_with_retry(&key(), &work, Duration::from_secs(5), 0)
            .await
            .unwrap_err();
        assert_eq!(err.safety_limit(), SafetyLimitKind::MaxRetriesExceeded);
        assert!(err.diagnostic().contains("attempts=1"));
    }
}
