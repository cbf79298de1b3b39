//! Governed pagination over the remote query API.
//!
//! The remote API caps every call at a fixed number of rows, so a query that spans more
//! rows must be issued page by page. Every page goes through the [`Governor`] under the
//! fingerprint of its own page query, and pages are accumulated in order. A query that
//! grows past the total-row ceiling fails with `RowCapExceeded`. It never returns a
//! truncated result.

use std::sync::Arc;

use serde::Serialize;

use crate::fingerprint::RequestKey;
use crate::governor::Governor;
use crate::http::{QueryClient, Row, query_attempt};
use crate::safety::{GovernedError, GovernedResult, SafetyLimit};

/// All rows of a paginated query, in page order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRows {
    pub rows: Vec<Row>,
    /// Number of page requests issued, including a trailing empty page.
    pub pages: usize,
}

/// Page query text for one window of `base_query`.
///
/// The `ORDER BY` clause is omitted when `order_by` is empty; a stable order across pages
/// is then the caller's responsibility.
pub fn build_page_query(base_query: &str, order_by: &str, offset: usize, page_size: usize) -> String {
    let base = base_query.trim().trim_end_matches(';');
    let order_by = order_by.trim();
    if order_by.is_empty() {
        format!(
            "{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            base, offset, page_size
        )
    } else {
        format!(
            "{} ORDER BY {} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            base, order_by, offset, page_size
        )
    }
}

/// Issues queries through a shared [`Governor`].
#[derive(Clone)]
pub struct Paginator<C: QueryClient> {
    governor: Governor,
    client: C,
}

impl<C: QueryClient + 'static> Paginator<C> {
    pub fn new(governor: Governor, client: C) -> Self {
        Self { governor, client }
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Run a single governed query without paging.
    pub async fn fetch_one(&self, query: &str) -> GovernedResult<Vec<Row>> {
        self.governed_query(query.to_string()).await
    }

    /// Fetch every row of `base_query`, `page_size` rows per call.
    ///
    /// Stops on the first page shorter than `page_size`, so a dataset of exactly
    /// `page_size` rows takes two calls: the full page and an empty one.
    ///
    /// The row cap is checked after every page. A running total that lands exactly on
    /// `max_total_rows` with a full page is not yet a failure: one more page is fetched.
    /// If that page is empty the query succeeds with exactly `max_total_rows` rows,
    /// otherwise the total now exceeds the cap and the query fails. At most one page
    /// beyond the cap is ever fetched.
    ///
    /// # Errors
    /// - [`GovernedError::InvalidRequest`] if `page_size` is zero or above the page ceiling
    /// - `RowCapExceeded` if the accumulated rows exceed the total-row ceiling
    /// - any failure of an individual page
    #[tracing::instrument(skip(self, base_query), fields(query_key = %RequestKey::for_query(base_query)))]
    pub async fn fetch_all_pages(
        &self,
        base_query: &str,
        page_size: usize,
        order_by: &str,
    ) -> GovernedResult<QueryRows> {
        let config = self.governor.config();
        if page_size == 0 || page_size > config.page_size_ceiling {
            return Err(GovernedError::InvalidRequest(format!(
                "page size {} must be between 1 and {}",
                page_size, config.page_size_ceiling
            )));
        }
        let max_total_rows = config.max_total_rows;

        let mut accumulated = QueryRows::default();
        let mut offset = 0;

        loop {
            let page_query = build_page_query(base_query, order_by, offset, page_size);
            let page = self.governed_query(page_query).await?;
            let page_len = page.len();

            accumulated.pages += 1;
            accumulated.rows.extend(page);

            tracing::info!(
                page = accumulated.pages,
                offset,
                page_rows = page_len,
                total_rows = accumulated.rows.len(),
                "Fetched page"
            );

            if accumulated.rows.len() > max_total_rows {
                let limit = SafetyLimit::row_cap_exceeded(
                    accumulated.rows.len(),
                    max_total_rows,
                    accumulated.pages,
                );
                self.governor.record_safety_limit(limit.kind());
                tracing::error!(
                    code = limit.kind().code(),
                    diagnostic = limit.diagnostic(),
                    "{}", limit.message()
                );
                return Err(limit.into());
            }

            if page_len < page_size {
                break;
            }
            offset += page_size;
        }

        tracing::debug!(
            pages = accumulated.pages,
            total_rows = accumulated.rows.len(),
            "Pagination complete"
        );
        Ok(accumulated)
    }

    async fn governed_query(&self, query: String) -> GovernedResult<Vec<Row>> {
        let config = self.governor.config();
        let timeout = config.default_timeout();
        let max_retries = config.default_max_retries;

        let key = RequestKey::for_query(&query);
        let query: Arc<str> = Arc::from(query);
        let client = self.client.clone();

        self.governor
            .execute(
                key,
                move || {
                    let client = client.clone();
                    let query = query.clone();
                    async move { query_attempt(&client, &query, timeout).await }
                },
                timeout,
                max_retries,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::GovernorConfig;
    use crate::http::{MockQueryClient, QueryResponse};
    use crate::safety::SafetyLimitKind;
    use serde_json::json;

    const BASE: &str = "SELECT id FROM transaction WHERE posting = 'T'";

    fn rows(range: std::ops::Range<usize>) -> Vec<Row> {
        range
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), json!(i));
                row
            })
            .collect()
    }

    fn paginator(config: GovernorConfig) -> (Paginator<MockQueryClient>, MockQueryClient) {
        let mock = MockQueryClient::new();
        let governor = Governor::new(GovernorConfig {
            min_interval_ms: 0,
            ..config
        })
        .unwrap();
        (Paginator::new(governor, mock.clone()), mock)
    }

    fn page(mock: &MockQueryClient, offset: usize, page_size: usize, data: Vec<Row>) {
        mock.add_response(
            &build_page_query(BASE, "id", offset, page_size),
            Ok(QueryResponse::with_rows(&data, false)),
        );
    }

    #[test]
    fn test_build_page_query() {
        assert_eq!(
            build_page_query("SELECT id FROM account;", "id", 2000, 1000),
            "SELECT id FROM account ORDER BY id OFFSET 2000 ROWS FETCH NEXT 1000 ROWS ONLY"
        );
        assert_eq!(
            build_page_query("SELECT id FROM account", "", 0, 10),
            "SELECT id FROM account OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_short_page_ends_pagination() {
        let (paginator, mock) = paginator(GovernorConfig::default());
        page(&mock, 0, 10, rows(0..10));
        page(&mock, 10, 10, rows(10..13));

        let result = paginator.fetch_all_pages(BASE, 10, "id").await.unwrap();
        assert_eq!(result.rows, rows(0..13));
        assert_eq!(result.pages, 2);
        assert_eq!(mock.call_count(), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_invalid_page_size_is_rejected() {
        let (paginator, mock) = paginator(GovernorConfig::default());

        for page_size in [0, 1001] {
            let err = paginator
                .fetch_all_pages(BASE, page_size, "id")
                .await
                .unwrap_err();
            assert!(matches!(err, GovernedError::InvalidRequest(_)));
            assert_eq!(err.code(), "INVALID");
        }
        assert_eq!(mock.call_count(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_page_failure_fails_whole_query() {
        let (paginator, mock) = paginator(GovernorConfig::default());
        page(&mock, 0, 10, rows(0..10));
        mock.add_response(
            &build_page_query(BASE, "id", 10, 10),
            Ok(QueryResponse::new(400, "Invalid search query")),
        );

        let err = paginator.fetch_all_pages(BASE, 10, "id").await.unwrap_err();
        assert!(matches!(err, GovernedError::Remote { .. }));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_row_cap_counts_safety_limit() {
        let (paginator, mock) = paginator(GovernorConfig {
            page_size_ceiling: 10,
            max_total_rows: 15,
            ..Default::default()
        });
        page(&mock, 0, 10, rows(0..10));
        page(&mock, 10, 10, rows(10..20));

        let err = paginator.fetch_all_pages(BASE, 10, "id").await.unwrap_err();
        assert_eq!(err.safety_limit(), SafetyLimitKind::RowCapExceeded);
        assert_eq!(err.code(), "ROWCAP");
        assert_eq!(paginator.governor().snapshot().safety_limit_hits, 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_fetch_one_returns_rows() {
        let (paginator, mock) = paginator(GovernorConfig::default());
        mock.add_response(
            "SELECT id FROM subsidiary",
            Ok(QueryResponse::with_rows(&rows(0..2), false)),
        );

        let result = paginator.fetch_one("SELECT id FROM subsidiary").await.unwrap();
        assert_eq!(result, rows(0..2));
    }
}
