//! Safety-limit taxonomy and the structured failure type returned by governed calls.
//!
//! A safety limit is the designed terminal failure of the governor: retries ran out, the
//! remote API kept rate limiting, a paginated query outgrew its row cap, or a caller
//! waited too long for a concurrency permit. Each one carries a short message that fits
//! in a spreadsheet cell and a longer diagnostic string for support and logs.
//!
//! Failures are values, not panics. [`GovernedError`] is `Clone` so that every caller
//! deduplicated onto the same in-flight request receives the same outcome.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of a governed unit of work.
pub type GovernedResult<T> = std::result::Result<T, GovernedError>;

/// The closed set of safety-limit tags.
///
/// `None` is the sentinel reported by [`GovernedError::safety_limit`] for failures that
/// are not safety limits (for example a non-retryable remote error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyLimitKind {
    None,
    MaxRetriesExceeded,
    RateLimitExceeded,
    RowCapExceeded,
    ConcurrencyTimeout,
}

impl SafetyLimitKind {
    /// Short, stable code suitable for rendering in a constrained UI surface.
    pub fn code(&self) -> &'static str {
        match self {
            SafetyLimitKind::None => "OK",
            SafetyLimitKind::MaxRetriesExceeded => "TIMEOUT",
            SafetyLimitKind::RateLimitExceeded => "RATELIMIT",
            SafetyLimitKind::RowCapExceeded => "ROWCAP",
            SafetyLimitKind::ConcurrencyTimeout => "BUSY",
        }
    }

    /// Low-cardinality label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLimitKind::None => "none",
            SafetyLimitKind::MaxRetriesExceeded => "max_retries_exceeded",
            SafetyLimitKind::RateLimitExceeded => "rate_limit_exceeded",
            SafetyLimitKind::RowCapExceeded => "row_cap_exceeded",
            SafetyLimitKind::ConcurrencyTimeout => "concurrency_timeout",
        }
    }
}

impl std::fmt::Display for SafetyLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A produced safety limit: the tag, a user-facing message and a support diagnostic.
///
/// Only constructible through the named constructors, so a safety limit always carries
/// a populated message and diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct SafetyLimit {
    kind: SafetyLimitKind,
    message: String,
    diagnostic: String,
}

impl SafetyLimit {
    /// Every attempt timed out.
    pub fn max_retries_exceeded(attempts: u32, per_attempt_timeout: Duration) -> Self {
        Self {
            kind: SafetyLimitKind::MaxRetriesExceeded,
            message: "NetSuite did not respond in time. Try recalculating later.".to_string(),
            diagnostic: format!(
                "max retries exceeded: attempts={} per_attempt_timeout_ms={}",
                attempts,
                per_attempt_timeout.as_millis()
            ),
        }
    }

    /// The remote API kept signalling rate limiting past the retry budget.
    pub fn rate_limit_exceeded(hits: u32, attempts: u32, consecutive_failures: u32) -> Self {
        Self {
            kind: SafetyLimitKind::RateLimitExceeded,
            message: "NetSuite is rate limiting requests. Wait a minute and recalculate."
                .to_string(),
            diagnostic: format!(
                "rate limit exceeded: hits={} attempts={} consecutive_failures={}",
                hits, attempts, consecutive_failures
            ),
        }
    }

    /// A paginated query would return more rows than the configured ceiling.
    pub fn row_cap_exceeded(rows_fetched: usize, max_total_rows: usize, pages: usize) -> Self {
        Self {
            kind: SafetyLimitKind::RowCapExceeded,
            message: format!(
                "Query returned more than {} rows. Narrow the filters.",
                max_total_rows
            ),
            diagnostic: format!(
                "row cap exceeded: rows_fetched={} max_total_rows={} pages={}",
                rows_fetched, max_total_rows, pages
            ),
        }
    }

    /// No concurrency permit became available within the configured wait.
    pub fn concurrency_timeout(waited: Duration, max_concurrency: usize) -> Self {
        Self {
            kind: SafetyLimitKind::ConcurrencyTimeout,
            message: "Too many queries are queued. Recalculate fewer cells at once.".to_string(),
            diagnostic: format!(
                "concurrency timeout: waited_ms={} max_concurrency={}",
                waited.as_millis(),
                max_concurrency
            ),
        }
    }

    pub fn kind(&self) -> SafetyLimitKind {
        self.kind
    }

    /// Short explanation for display.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Counts and attempt numbers for support and logging.
    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }
}

/// Failure outcome of a governed call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GovernedError {
    /// A retry, backoff, row or admission budget was exhausted.
    #[error(transparent)]
    SafetyLimit(#[from] SafetyLimit),

    /// The remote call failed with an error that is not worth retrying.
    #[error("Remote query failed: {message}")]
    Remote { message: String },

    /// The request was rejected before any remote call was made.
    #[error("Invalid governed request: {0}")]
    InvalidRequest(String),

    /// The task driving the request panicked or was aborted.
    #[error("Governed task terminated unexpectedly")]
    TaskTerminated,
}

impl GovernedError {
    /// The safety-limit tag of this failure, or `SafetyLimitKind::None`.
    pub fn safety_limit(&self) -> SafetyLimitKind {
        match self {
            GovernedError::SafetyLimit(limit) => limit.kind(),
            _ => SafetyLimitKind::None,
        }
    }

    pub fn is_safety_limit(&self) -> bool {
        self.safety_limit() != SafetyLimitKind::None
    }

    /// Short, stable code for a spreadsheet cell. Never collides with a data value.
    pub fn code(&self) -> &'static str {
        match self {
            GovernedError::SafetyLimit(limit) => limit.kind().code(),
            GovernedError::Remote { .. } => "ERROR",
            GovernedError::InvalidRequest(_) => "INVALID",
            GovernedError::TaskTerminated => "ERROR",
        }
    }

    /// Longer diagnostic text for support.
    pub fn diagnostic(&self) -> String {
        match self {
            GovernedError::SafetyLimit(limit) => limit.diagnostic().to_string(),
            other => other.to_string(),
        }
    }
}
