//! Request governance and guaranteed pagination for a rate-limited remote query API.
//!
//! This crate sits between an unbounded number of logical callers (e.g. spreadsheet
//! formulas recalculating at once) and a remote SuiteQL endpoint that enforces a hard
//! concurrency ceiling, rate limits and a per-call row maximum. A [`Governor`] deduplicates
//! identical in-flight requests, admits at most a configured number at a time, paces call
//! starts, shares one backoff window across all callers and retries within fixed bounds.
//! A [`Paginator`] uses it to fetch complete result sets page by page.
//!
//! Every failure reaches the caller as an explicit [`GovernedError`]. Exhausted budgets are
//! reported as [`SafetyLimit`]s with a short code and a diagnostic, never as an empty result.

pub mod error;
pub mod fingerprint;
pub mod governor;
pub mod http;
pub mod metrics;
pub mod pagination;
pub mod safety;

// Re-export commonly used types
pub use error::{Error, Result};
pub use fingerprint::RequestKey;
pub use governor::{Attempt, Governor, GovernorConfig, GovernorId};
pub use http::{
    MockQueryClient, QueryClient, QueryResponse, ReqwestQueryClient, Row, classify_error,
    classify_response,
};
pub use crate::metrics::MetricsSnapshot;
pub use pagination::{Paginator, QueryRows, build_page_query};
pub use safety::{GovernedError, GovernedResult, SafetyLimit, SafetyLimitKind};

#[cfg(feature = "metrics")]
pub use crate::metrics::PrometheusMetrics;
