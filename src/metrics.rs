//! Metrics for governor monitoring.
//!
//! Counters are plain atomics owned by the governor so a [`MetricsSnapshot`] can always be
//! taken without any recorder installed. The same events are also emitted through the
//! `metrics` facade, and with the `metrics` feature a Prometheus registry can be refreshed
//! from snapshots.
//!
//! Metrics are organized into two categories:
//! - **Counters**: Cumulative totals (requests, deduplicated, rate-limit hits, retries, safety limits)
//! - **Gauges**: Point-in-time state (concurrency, in-flight registry size, backoff window)

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;

use crate::safety::SafetyLimitKind;

/// Why an attempt was retried. Used as a low-cardinality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    RateLimit,
    Timeout,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::RateLimit => "rate_limit",
            RetryReason::Timeout => "timeout",
        }
    }
}

/// Monotonic counters updated from any task.
#[derive(Debug, Default)]
pub struct GovernorMetrics {
    total_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    rate_limit_hits: AtomicU64,
    retried_attempts: AtomicU64,
    safety_limit_hits: AtomicU64,
}

impl GovernorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        counter!("suiteql_governor_requests_total").increment(1);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
        counter!("suiteql_governor_deduplicated_total").increment(1);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        counter!("suiteql_governor_rate_limit_hits_total").increment(1);
    }

    pub fn record_retry(&self, reason: RetryReason) {
        self.retried_attempts.fetch_add(1, Ordering::Relaxed);
        counter!("suiteql_governor_retries_total", "reason" => reason.as_str()).increment(1);
    }

    pub fn record_safety_limit(&self, kind: SafetyLimitKind) {
        self.safety_limit_hits.fetch_add(1, Ordering::Relaxed);
        counter!("suiteql_governor_safety_limit_hits_total", "kind" => kind.as_str())
            .increment(1);
    }

    /// Read all counters. No cross-counter atomicity.
    pub(crate) fn counters(&self) -> CounterValues {
        CounterValues {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            retried_attempts: self.retried_attempts.load(Ordering::Relaxed),
            safety_limit_hits: self.safety_limit_hits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CounterValues {
    pub total_requests: u64,
    pub deduplicated_requests: u64,
    pub rate_limit_hits: u64,
    pub retried_attempts: u64,
    pub safety_limit_hits: u64,
}

/// Point-in-time view of the governor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub deduplicated_requests: u64,
    /// `deduplicated_requests / total_requests`, 0 when no requests were made.
    pub deduplication_rate: f64,
    pub rate_limit_hits: u64,
    pub retried_attempts: u64,
    pub safety_limit_hits: u64,
    /// Permits currently held.
    pub current_concurrency: usize,
    /// Highest number of permits held at once since the governor started.
    pub peak_concurrency: usize,
    /// Configured permit ceiling.
    pub max_concurrency: usize,
    /// Fingerprints currently registered as in flight.
    pub in_flight: usize,
    /// Whether the shared backoff window is currently active.
    pub backed_off: bool,
    /// Wall-clock end of the backoff window, if active.
    pub backoff_until: Option<DateTime<Utc>>,
    pub consecutive_rate_limit_failures: u32,
}

impl MetricsSnapshot {
    pub(crate) fn from_counters(counters: CounterValues) -> Self {
        let deduplication_rate = if counters.total_requests == 0 {
            0.0
        } else {
            counters.deduplicated_requests as f64 / counters.total_requests as f64
        };
        Self {
            total_requests: counters.total_requests,
            deduplicated_requests: counters.deduplicated_requests,
            deduplication_rate,
            rate_limit_hits: counters.rate_limit_hits,
            retried_attempts: counters.retried_attempts,
            safety_limit_hits: counters.safety_limit_hits,
            ..Default::default()
        }
    }
}

#[cfg(feature = "metrics")]
pub use self::prometheus_export::PrometheusMetrics;

#[cfg(feature = "metrics")]
mod prometheus_export {
    use prometheus::{IntCounter, IntGauge, Opts, Registry};

    use super::MetricsSnapshot;
    use crate::error::Result;

    /// Prometheus registry view of the governor, refreshed from snapshots.
    #[derive(Clone)]
    pub struct PrometheusMetrics {
        registry: Registry,

        // Counters (cumulative totals)
        requests_total: IntCounter,
        deduplicated_total: IntCounter,
        rate_limit_hits_total: IntCounter,
        retries_total: IntCounter,
        safety_limit_hits_total: IntCounter,

        // Gauges (point-in-time state)
        current_concurrency: IntGauge,
        peak_concurrency: IntGauge,
        in_flight: IntGauge,
        backed_off: IntGauge,
    }

    fn int_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
        let counter = IntCounter::with_opts(Opts::new(name, help))
            .map_err(|e| anyhow::anyhow!("Failed to create {} counter: {}", name, e))?;
        registry
            .register(Box::new(counter.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register {}: {}", name, e))?;
        Ok(counter)
    }

    fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
        let gauge = IntGauge::with_opts(Opts::new(name, help))
            .map_err(|e| anyhow::anyhow!("Failed to create {} gauge: {}", name, e))?;
        registry
            .register(Box::new(gauge.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register {}: {}", name, e))?;
        Ok(gauge)
    }

    impl PrometheusMetrics {
        /// Register all governor metrics with the provided registry.
        ///
        /// # Errors
        ///
        /// Returns an error if metrics fail to register (e.g., duplicate registration).
        pub fn new(registry: Registry) -> Result<Self> {
            Ok(Self {
                requests_total: int_counter(
                    &registry,
                    "suiteql_governor_requests_total",
                    "Total number of governed requests",
                )?,
                deduplicated_total: int_counter(
                    &registry,
                    "suiteql_governor_deduplicated_total",
                    "Requests served by an identical in-flight request",
                )?,
                rate_limit_hits_total: int_counter(
                    &registry,
                    "suiteql_governor_rate_limit_hits_total",
                    "Rate-limit signals received from the remote API",
                )?,
                retries_total: int_counter(
                    &registry,
                    "suiteql_governor_retries_total",
                    "Remote call attempts that were retried",
                )?,
                safety_limit_hits_total: int_counter(
                    &registry,
                    "suiteql_governor_safety_limit_hits_total",
                    "Requests that ended in a safety limit",
                )?,
                current_concurrency: int_gauge(
                    &registry,
                    "suiteql_governor_current_concurrency",
                    "Concurrency permits currently held",
                )?,
                peak_concurrency: int_gauge(
                    &registry,
                    "suiteql_governor_peak_concurrency",
                    "Highest number of permits held at once",
                )?,
                in_flight: int_gauge(
                    &registry,
                    "suiteql_governor_in_flight",
                    "Fingerprints registered as in flight",
                )?,
                backed_off: int_gauge(
                    &registry,
                    "suiteql_governor_backed_off",
                    "1 while the shared backoff window is active",
                )?,
                registry,
            })
        }

        /// Get the underlying Prometheus registry.
        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// Bring the registry in line with a snapshot.
        pub fn update(&self, snapshot: &MetricsSnapshot) {
            advance(&self.requests_total, snapshot.total_requests);
            advance(&self.deduplicated_total, snapshot.deduplicated_requests);
            advance(&self.rate_limit_hits_total, snapshot.rate_limit_hits);
            advance(&self.retries_total, snapshot.retried_attempts);
            advance(&self.safety_limit_hits_total, snapshot.safety_limit_hits);

            self.current_concurrency
                .set(snapshot.current_concurrency as i64);
            self.peak_concurrency.set(snapshot.peak_concurrency as i64);
            self.in_flight.set(snapshot.in_flight as i64);
            self.backed_off.set(i64::from(snapshot.backed_off));
        }
    }

    // Counters only move forward.
    fn advance(counter: &IntCounter, total: u64) {
        let current = counter.get();
        if total > current {
            counter.inc_by(total - current);
        }
    }

}
