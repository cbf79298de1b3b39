//! Remote query client abstraction.
//!
//! This module defines the `QueryClient` trait for the one capability the governor consumes
//! from the transport layer: send a query, get back one raw response. Interpreting that
//! response as success, rate limiting, timeout or failure is done by [`classify_response`]
//! and [`classify_error`], so the same rules apply to every client implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::governor::Attempt;

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Raw response from one remote query round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

impl QueryResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A 200 response carrying `rows` in the SuiteQL `items` envelope.
    pub fn with_rows(rows: &[Row], has_more: bool) -> Self {
        let body = serde_json::json!({
            "items": rows,
            "count": rows.len(),
            "hasMore": has_more,
        });
        Self::new(200, body.to_string())
    }
}

/// Trait for executing remote queries.
///
/// Implementations perform exactly one round trip per call and never retry. Retrying,
/// pacing and backoff belong to the governor.
///
/// # Example
/// ```ignore
/// let client = ReqwestQueryClient::for_account("1234567", auth_header);
/// let response = client.execute("SELECT id FROM subsidiary", Duration::from_secs(30)).await?;
/// println!("Status: {}, Body: {}", response.status, response.body);
/// ```
#[async_trait]
pub trait QueryClient: Send + Sync + Clone {
    /// Execute a query.
    ///
    /// # Errors
    /// Returns an error if the request fails due to network issues or times out.
    /// Non-2xx responses are returned as `Ok` for classification.
    async fn execute(&self, query: &str, timeout: Duration) -> Result<QueryResponse>;
}

// ============================================================================
// Response classification
// ============================================================================

/// Error codes the remote API uses in place of (or alongside) HTTP 429.
const RATE_LIMIT_MARKERS: [&str; 2] = ["CONCURRENCY_LIMIT_EXCEEDED", "SSS_REQUEST_LIMIT_EXCEEDED"];

#[derive(Deserialize)]
struct SuiteQlPage {
    #[serde(default)]
    items: Vec<Row>,
}

/// SuiteQL error body, e.g. `{"o:errorDetails":[{"o:errorCode":"CONCURRENCY_LIMIT_EXCEEDED"}]}`.
#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "o:errorDetails", default)]
    error_details: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "o:errorCode", default)]
    error_code: Option<String>,
}

/// Map a raw response onto the tagged outcome the retry executor branches on.
///
/// Rate-limit error codes are only looked for in non-2xx responses, so row data that
/// happens to mention them is still a success.
pub fn classify_response(response: &QueryResponse) -> Attempt<Vec<Row>> {
    let status = response.status;

    if (200..300).contains(&status) {
        return match parse_rows(&response.body) {
            Ok(rows) => Attempt::Success(rows),
            Err(e) => Attempt::Failed {
                message: format!("unreadable query response: {}", e),
            },
        };
    }
    if status == 429 || is_rate_limit_error(&response.body) {
        return Attempt::RateLimited {
            detail: format!("status {}: {}", status, truncate(&response.body)),
        };
    }
    if status == 408 || status == 504 {
        return Attempt::TimedOut;
    }
    Attempt::Failed {
        message: format!("status {}: {}", status, truncate(&response.body)),
    }
}

/// Whether an error body carries one of the rate-limit error codes.
///
/// Structured bodies are matched on `o:errorCode`; anything that is not JSON falls back to
/// a plain text search.
fn is_rate_limit_error(body: &str) -> bool {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope
            .error_details
            .iter()
            .filter_map(|detail| detail.error_code.as_deref())
            .any(|code| RATE_LIMIT_MARKERS.contains(&code)),
        Err(_) => RATE_LIMIT_MARKERS.iter().any(|marker| body.contains(marker)),
    }
}

/// Map a transport error onto the tagged outcome. Timeouts are retriable.
pub fn classify_error<T>(error: &Error) -> Attempt<T> {
    if error.is_timeout() {
        Attempt::TimedOut
    } else {
        Attempt::Failed {
            message: error.to_string(),
        }
    }
}

/// Execute `query` once and classify the outcome.
pub async fn query_attempt<C: QueryClient>(
    client: &C,
    query: &str,
    timeout: Duration,
) -> Attempt<Vec<Row>> {
    match client.execute(query, timeout).await {
        Ok(response) => classify_response(&response),
        Err(e) => classify_error(&e),
    }
}

fn parse_rows(body: &str) -> Result<Vec<Row>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let page: SuiteQlPage = serde_json::from_str(body)?;
    Ok(page
        .items
        .into_iter()
        .map(|mut row| {
            row.remove("links");
            row
        })
        .collect())
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 500;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production query client using reqwest.
///
/// POSTs `{"q": query}` with `Prefer: transient`. Request signing is the caller's concern:
/// the `Authorization` header value is supplied pre-computed.
#[derive(Clone)]
pub struct ReqwestQueryClient {
    client: reqwest::Client,
    url: String,
    authorization: Option<String>,
}

impl ReqwestQueryClient {
    pub fn new(url: impl Into<String>, authorization: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            authorization,
        }
    }

    /// Client for the SuiteQL endpoint of a NetSuite account.
    ///
    /// Sandbox ids such as `1234567_SB1` become the `1234567-sb1` host prefix.
    pub fn for_account(account_id: &str, authorization: Option<String>) -> Self {
        let host = account_id.to_lowercase().replace('_', "-");
        Self::new(
            format!(
                "https://{}.suitetalk.api.netsuite.com/services/rest/query/v1/suiteql",
                host
            ),
            authorization,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl QueryClient for ReqwestQueryClient {
    #[tracing::instrument(skip(self, query), fields(url = %self.url, query_len = query.len()))]
    async fn execute(&self, query: &str, timeout: Duration) -> Result<QueryResponse> {
        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Executing query");

        let mut req = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("Prefer", "transient")
            .json(&serde_json::json!({ "q": query }));

        if let Some(authorization) = &self.authorization {
            req = req.header("Authorization", authorization);
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(error = %e, timeout = e.is_timeout(), "Query request failed");
            e
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(status, response_len = body.len(), "Query request completed");

        Ok(QueryResponse { status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Mock query client for testing.
///
/// Responses are queued per exact query text and returned in FIFO order. Queries with no
/// queued response get the default response if one is set, or an error.
///
/// # Example
/// ```ignore
/// let mock = MockQueryClient::new();
/// mock.add_response("SELECT id FROM subsidiary", Ok(QueryResponse::new(429, "")));
/// mock.add_response("SELECT id FROM subsidiary", Ok(QueryResponse::with_rows(&rows, false)));
/// ```
#[derive(Clone, Default)]
pub struct MockQueryClient {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    default_response: Arc<Mutex<Option<(QueryResponse, Duration)>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally take time or wait for a trigger before completing.
enum MockResponse {
    Immediate(Result<QueryResponse>),
    Delayed {
        response: Result<QueryResponse>,
        delay: Duration,
    },
    Triggered {
        response: Result<QueryResponse>,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a call made to the mock client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub query: String,
    pub timeout: Duration,
    pub started_at: Instant,
}

impl MockQueryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for an exact query text.
    pub fn add_response(&self, query: &str, response: Result<QueryResponse>) {
        self.push(query, MockResponse::Immediate(response));
    }

    /// Queue a response that completes after `delay`.
    pub fn add_delayed_response(&self, query: &str, response: Result<QueryResponse>, delay: Duration) {
        self.push(query, MockResponse::Delayed { response, delay });
    }

    /// Queue a response that waits for a manual trigger before completing.
    ///
    /// Returns a sender that when triggered (by sending `()` or dropping) will cause the
    /// call to complete with the given response.
    pub fn add_response_with_trigger(
        &self,
        query: &str,
        response: Result<QueryResponse>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            query,
            MockResponse::Triggered {
                response,
                trigger: rx,
            },
        );
        tx
    }

    /// Response for any query without a queued response, completing after `delay`.
    pub fn set_default_response(&self, response: QueryResponse, delay: Duration) {
        *self.default_response.lock() = Some((response, delay));
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls made with exactly this query text.
    pub fn calls_for(&self, query: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.query == query).count()
    }

    /// Get the number of calls currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were executing at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn push(&self, query: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(query.to_string())
            .or_default()
            .push_back(response);
    }
}

#[async_trait]
impl QueryClient for MockQueryClient {
    async fn execute(&self, query: &str, timeout: Duration) -> Result<QueryResponse> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        // Decrement even if the call is cancelled by a timeout
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            query: query.to_string(),
            timeout,
            started_at: Instant::now(),
        });

        let queued = self
            .responses
            .lock()
            .get_mut(query)
            .and_then(|queue| queue.pop_front());

        match queued {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Delayed { response, delay }) => {
                tokio::time::sleep(delay).await;
                response
            }
            Some(MockResponse::Triggered { response, trigger }) => {
                // Proceed whether the trigger fired or was dropped
                let _ = trigger.await;
                response
            }
            None => {
                let default = self.default_response.lock().clone();
                match default {
                    Some((response, delay)) => {
                        tokio::time::sleep(delay).await;
                        Ok(response)
                    }
                    None => Err(Error::Other(anyhow::anyhow!(
                        "No mock response configured for query: {}",
                        query
                    ))),
                }
            }
        }
    }
}
