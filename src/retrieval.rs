//! Metrics retrieval capability
//!
//! The pager in [`crate::extract`] drives any implementation of
//! [`MetricsRetrieval`]; [`crate::cloudwatch::HttpMetricsRetrieval`] is the
//! production one.

use crate::error::RetrievalError;
use crate::query::CompiledQuery;
use async_trait::async_trait;

/// Time range `[start, end)` queried in one invocation, in unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    /// One-minute window ending `ingestion_delay` seconds before the minute
    /// boundary at or before `now`
    ///
    /// Aligning on the minute keeps results on the 60-second period
    /// boundaries the queries ask for.
    pub fn ending_before(now: i64, ingestion_delay: i64) -> Self {
        let end = now - now.rem_euclid(60) - ingestion_delay;
        Self {
            start: end - 60,
            end,
        }
    }
}

/// One result row, echoing the query's label
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultRow {
    pub label: String,
    /// Unix seconds, parallel to `values`
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultPage {
    pub rows: Vec<ResultRow>,
    /// Continuation token; `None` means this was the last page
    pub next_token: Option<String>,
}

/// Fetch a page of metric results for a batch of queries
#[async_trait]
pub trait MetricsRetrieval: Send + Sync {
    async fn fetch_page(
        &self,
        window: Window,
        queries: &[CompiledQuery],
        next_token: Option<&str>,
    ) -> Result<ResultPage, RetrievalError>;
}
