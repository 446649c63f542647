//! Result extraction and pagination
//!
//! Walks the provider's result pages for a compiled batch, routes each row to
//! its destination via the decoded label and fills in defaults for series
//! that returned no datapoints.

use crate::buffer::MetricSet;
use crate::error::AppResult;
use crate::label::Label;
use crate::query::CompiledBatch;
use crate::retrieval::{MetricsRetrieval, Window};
use std::collections::HashSet;

/// `GetMetricData` accepts at most this many queries per request
pub const MAX_QUERIES_PER_REQUEST: usize = 500;

/// Counters from one fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub pages: usize,
    pub values: usize,
    pub defaults_applied: usize,
}

/// Fetch every page for `batch` into `into`
///
/// Values already written to `into` stay there when a page fails, so callers
/// can still deliver partial results. A label that cannot be decoded aborts
/// the fetch. Defaults are applied once all pages have been consumed, at the
/// window start.
pub async fn fetch_metrics(
    retrieval: &dyn MetricsRetrieval,
    window: Window,
    batch: &CompiledBatch,
    into: &mut MetricSet,
) -> AppResult<FetchSummary> {
    let mut summary = FetchSummary::default();
    let mut seen: HashSet<String> = HashSet::new();

    for chunk in batch.queries.chunks(MAX_QUERIES_PER_REQUEST) {
        let mut next_token: Option<String> = None;
        loop {
            let page = retrieval
                .fetch_page(window, chunk, next_token.as_deref())
                .await?;
            summary.pages += 1;

            for row in page.rows {
                let label = Label::decode(&row.label)?;
                if row.timestamps.len() != row.values.len() {
                    tracing::warn!(
                        label = %row.label,
                        timestamps = row.timestamps.len(),
                        values = row.values.len(),
                        "Timestamps and values differ in length, extra entries ignored"
                    );
                }
                if !row.timestamps.is_empty() && !row.values.is_empty() {
                    seen.insert(row.label.clone());
                }
                for (time, value) in row.timestamps.iter().zip(&row.values) {
                    into.insert(&label, *time, *value);
                    summary.values += 1;
                }
            }

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
    }

    for (encoded, default) in &batch.defaults {
        if seen.contains(encoded) {
            continue;
        }
        let label = Label::decode(encoded)?;
        tracing::debug!(
            label = %encoded,
            default = *default,
            time = window.start,
            "No datapoints, using default value"
        );
        into.insert(&label, window.start, *default);
        summary.defaults_applied += 1;
    }

    Ok(summary)
}
