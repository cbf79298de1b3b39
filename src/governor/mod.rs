//! Request governor: the single shared throttle in front of the remote query API.
//!
//! A [`Governor`] is a cheap handle around one set of shared state (in-flight registry,
//! backoff window, concurrency permits, pacer, metrics). Clone it and hand it to every
//! caller that should share the same throttle.
//!
//! ```text
//! execute(key, work)
//!   ├─ key already in flight ──────────────────────────────► await shared outcome
//!   └─ register key, spawn governed task:
//!        wait backoff → acquire permit → [wait backoff → pace → work()]* → release
//! ```
use std::any::Any;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fingerprint::RequestKey;
use crate::metrics::{GovernorMetrics, MetricsSnapshot};
use crate::safety::{GovernedError, GovernedResult, SafetyLimitKind};

pub mod backoff;
pub mod in_flight;
pub mod limiter;
pub mod retry;

pub use backoff::BackoffController;
pub use in_flight::{InFlightRegistry, InFlightSlot, Joined, SharedOutcome};
pub use limiter::{ConcurrencyLimiter, ConcurrencyPermit, IntervalPacer};
pub use retry::{Attempt, RetryConfig};

use retry::RetryExecutor;

/// Type-erased payload stored in the in-flight registry.
type AnyPayload = Arc<dyn Any + Send + Sync>;

/// Configuration for the governor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Maximum number of governed computations holding a permit at once
    pub max_concurrency: usize,

    /// The remote account's own concurrency ceiling. Only used for validation.
    pub remote_concurrency_ceiling: usize,

    /// Minimum spacing between remote call starts in milliseconds
    pub min_interval_ms: u64,

    /// Base of the shared rate-limit backoff in milliseconds (doubled per consecutive hit)
    pub rate_limit_backoff_base_ms: u64,

    /// Maximum shared backoff window in milliseconds
    pub max_backoff_ms: u64,

    /// Base of the per-call timeout retry delay in milliseconds (doubled per attempt)
    pub retry_delay_base_ms: u64,

    /// Per-attempt timeout used by the paginator
    pub default_timeout_ms: u64,

    /// Retry bound used by the paginator
    pub default_max_retries: u32,

    /// Maximum wait for a concurrency permit in milliseconds.
    /// Set to None to wait indefinitely.
    pub permit_wait_timeout_ms: Option<u64>,

    /// Hard remote per-call row maximum
    pub page_size_ceiling: usize,

    /// Total rows a paginated query may return before failing with `RowCapExceeded`
    pub max_total_rows: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            remote_concurrency_ceiling: 5,
            min_interval_ms: 100,
            rate_limit_backoff_base_ms: 1000,
            max_backoff_ms: 30000,
            retry_delay_base_ms: 1000,
            default_timeout_ms: 30000,
            default_max_retries: 3,
            permit_wait_timeout_ms: Some(120000), // 2 minutes
            page_size_ceiling: 1000,
            max_total_rows: 100000,
        }
    }
}

impl GovernorConfig {
    /// Defaults overlaid with `SUITEQL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        override_from(&lookup, "SUITEQL_MAX_CONCURRENCY", &mut config.max_concurrency)?;
        override_from(&lookup, "SUITEQL_MIN_INTERVAL_MS", &mut config.min_interval_ms)?;
        override_from(&lookup, "SUITEQL_MAX_BACKOFF_MS", &mut config.max_backoff_ms)?;
        override_from(&lookup, "SUITEQL_TIMEOUT_MS", &mut config.default_timeout_ms)?;
        override_from(&lookup, "SUITEQL_MAX_RETRIES", &mut config.default_max_retries)?;
        override_from(&lookup, "SUITEQL_PAGE_SIZE_CEILING", &mut config.page_size_ceiling)?;
        override_from(&lookup, "SUITEQL_MAX_TOTAL_ROWS", &mut config.max_total_rows)?;

        if let Some(raw) = lookup("SUITEQL_PERMIT_WAIT_TIMEOUT_MS") {
            config.permit_wait_timeout_ms = match raw.trim() {
                "" | "none" => None,
                value => Some(parse_var("SUITEQL_PERMIT_WAIT_TIMEOUT_MS", value)?),
            };
        }
        Ok(config)
    }

    /// Reject configurations the governor cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.max_concurrency >= self.remote_concurrency_ceiling {
            return Err(Error::Config(format!(
                "max_concurrency ({}) must stay below the remote concurrency ceiling ({})",
                self.max_concurrency, self.remote_concurrency_ceiling
            )));
        }
        if self.page_size_ceiling == 0 {
            return Err(Error::Config("page_size_ceiling must be at least 1".to_string()));
        }
        if self.max_total_rows < self.page_size_ceiling {
            return Err(Error::Config(format!(
                "max_total_rows ({}) must allow at least one full page ({})",
                self.max_total_rows, self.page_size_ceiling
            )));
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn permit_wait_timeout(&self) -> Option<Duration> {
        self.permit_wait_timeout_ms.map(Duration::from_millis)
    }
}

fn override_from<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *target = parse_var(name, raw.trim())?;
    }
    Ok(())
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| Error::Config(format!("invalid value '{}' for {}: {}", raw, name, e)))
}

/// Identifier of one governor instance, used to tell instances apart in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GovernorId(pub Uuid);

impl std::fmt::Display for GovernorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Shared admission, pacing, retry and deduplication for remote calls.
#[derive(Clone)]
pub struct Governor {
    inner: Arc<GovernorInner>,
}

struct GovernorInner {
    id: GovernorId,
    config: GovernorConfig,
    backoff: BackoffController,
    limiter: ConcurrencyLimiter,
    pacer: IntervalPacer,
    in_flight: InFlightRegistry<AnyPayload>,
    metrics: GovernorMetrics,
}

impl Governor {
    /// Create a governor after validating `config`.
    pub fn new(config: GovernorConfig) -> Result<Self> {
        config.validate()?;

        let inner = GovernorInner {
            id: GovernorId(Uuid::new_v4()),
            backoff: BackoffController::new(
                Duration::from_millis(config.rate_limit_backoff_base_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
            limiter: ConcurrencyLimiter::new(config.max_concurrency),
            pacer: IntervalPacer::new(config.min_interval()),
            in_flight: InFlightRegistry::new(),
            metrics: GovernorMetrics::new(),
            config,
        };
        tracing::info!(
            governor_id = %inner.id,
            max_concurrency = inner.config.max_concurrency,
            min_interval_ms = inner.config.min_interval_ms,
            "Created governor"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn id(&self) -> GovernorId {
        self.inner.id
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Run `work` under governance and return the outcome of exactly one execution per
    /// outstanding `key`.
    ///
    /// Concurrent callers with the same `key` share one execution and all receive its
    /// outcome. The computation runs on its own task, so it keeps going for the remaining
    /// callers if this one stops awaiting.
    ///
    /// # Errors
    /// - [`GovernedError::SafetyLimit`] when a retry, rate-limit or permit-wait budget runs out
    /// - [`GovernedError::Remote`] for non-retriable failures reported by `work`
    /// - [`GovernedError::TaskTerminated`] if the governed task panicked
    #[tracing::instrument(skip(self, key, work), fields(governor_id = %self.inner.id, key = %key))]
    pub async fn execute<T, F, Fut>(
        &self,
        key: RequestKey,
        work: F,
        timeout: Duration,
        max_retries: u32,
    ) -> GovernedResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Attempt<T>> + Send + 'static,
    {
        self.inner.metrics.record_request();

        let joined = self.inner.in_flight.join_or_start(&key, |slot| {
            let inner = self.inner.clone();
            let governed = async move {
                let result = inner
                    .run_governed(slot.key(), &work, timeout, max_retries)
                    .await
                    .map(|value| Arc::new(value) as AnyPayload);
                // The entry is released before the outcome is published.
                drop(slot);
                result
            };
            let handle = tokio::spawn(governed.in_current_span());

            async move {
                handle.await.unwrap_or_else(|e| {
                    tracing::error!(error = %e, "Governed task terminated before completing");
                    Err(GovernedError::TaskTerminated)
                })
            }
            .boxed()
            .shared()
        });

        let outcome = match joined {
            Joined::Started(outcome) => outcome,
            Joined::Existing(outcome) => {
                self.inner.metrics.record_deduplicated();
                tracing::debug!("Joined in-flight request");
                outcome
            }
        };

        let payload = outcome.await?;
        payload
            .downcast::<T>()
            .map(Arc::unwrap_or_clone)
            .map_err(|_| {
                GovernedError::InvalidRequest(format!(
                    "request key {} is already in flight with a different result type",
                    key
                ))
            })
    }

    /// Point-in-time metrics for this governor.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let mut snapshot = MetricsSnapshot::from_counters(inner.metrics.counters());

        snapshot.current_concurrency = inner.limiter.active();
        snapshot.peak_concurrency = inner.limiter.peak();
        snapshot.max_concurrency = inner.limiter.max();
        snapshot.in_flight = inner.in_flight.len();
        snapshot.consecutive_rate_limit_failures = inner.backoff.consecutive_failures();

        let banned_until = inner.backoff.banned_until();
        snapshot.backed_off = banned_until.is_some();
        snapshot.backoff_until = banned_until.and_then(|until| {
            let remaining = until.saturating_duration_since(Instant::now());
            chrono::Duration::from_std(remaining)
                .ok()
                .map(|remaining| Utc::now() + remaining)
        });

        snapshot
    }

    /// Count a safety limit produced outside the governed task (e.g. the row cap).
    pub(crate) fn record_safety_limit(&self, kind: SafetyLimitKind) {
        self.inner.metrics.record_safety_limit(kind);
    }
}

impl GovernorInner {
    async fn run_governed<T, F, Fut>(
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
        let result = async {
            self.backoff.wait().await;
            let _permit = self
                .limiter
                .acquire(self.config.permit_wait_timeout())
                .await?;

            let executor = RetryExecutor {
                backoff: &self.backoff,
                pacer: &self.pacer,
                metrics: &self.metrics,
                config: RetryConfig {
                    retry_delay_base: Duration::from_millis(self.config.retry_delay_base_ms),
                },
            };
            executor
                .execute_with_retry(key, work, timeout, max_retries)
                .await
        }
        .await;

        if let Err(GovernedError::SafetyLimit(limit)) = &result {
            self.metrics.record_safety_limit(limit.kind());
            tracing::error!(
                key = %key,
                code = limit.kind().code(),
                diagnostic = limit.diagnostic(),
                "{}", limit.message()
            );
        }
        result
    }
}
