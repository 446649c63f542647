//! HTTP adapter for CloudWatch `GetMetricData`
//!
//! Speaks the AWS JSON 1.0 protocol against a configured endpoint. Request
//! signing is not done here; point the endpoint at a signing proxy or a
//! local emulator.

use crate::error::{AppError, AppResult, RetrievalError};
use crate::query::CompiledQuery;
use crate::retrieval::{MetricsRetrieval, ResultPage, ResultRow, Window};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const TARGET: &str = "GraniteServiceVersion20100801.GetMetricData";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricDataInput<'a> {
    start_time: i64,
    end_time: i64,
    metric_data_queries: &'a [CompiledQuery],
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
    scan_by: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricDataOutput {
    #[serde(default)]
    metric_data_results: Vec<MetricDataResult>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetricDataResult {
    #[serde(default)]
    id: String,
    #[serde(default)]
    label: String,
    /// Epoch seconds; the JSON protocol encodes timestamps as numbers
    #[serde(default)]
    timestamps: Vec<f64>,
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    status_code: Option<String>,
}

/// [`MetricsRetrieval`] over HTTP
pub struct HttpMetricsRetrieval {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMetricsRetrieval {
    /// Create a retrieval client for `endpoint` with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MetricsRetrieval for HttpMetricsRetrieval {
    async fn fetch_page(
        &self,
        window: Window,
        queries: &[CompiledQuery],
        next_token: Option<&str>,
    ) -> Result<ResultPage, RetrievalError> {
        let input = GetMetricDataInput {
            start_time: window.start,
            end_time: window.end,
            metric_data_queries: queries,
            next_token,
            scan_by: "TimestampAscending",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Amz-Target", TARGET)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&input)
            .send()
            .await
            .map_err(RetrievalError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(RetrievalError::Transport)?;
        if !status.is_success() {
            return Err(RetrievalError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let output: GetMetricDataOutput =
            serde_json::from_str(&body).map_err(|e| RetrievalError::Decode(e.to_string()))?;

        let rows = output
            .metric_data_results
            .into_iter()
            .map(|result| {
                if let Some(code) = result.status_code.as_deref()
                    && code != "Complete"
                {
                    tracing::debug!(
                        id = %result.id,
                        label = %result.label,
                        status_code = %code,
                        "Metric data result is not complete"
                    );
                }
                ResultRow {
                    label: result.label,
                    // Epoch seconds arrive as JSON numbers; round so a value
                    // like 1704067619.9999 still lands on its minute
                    timestamps: result.timestamps.iter().map(|t| t.round() as i64).collect(),
                    values: result.values,
                }
            })
            .collect();

        tracing::debug!(
            queries = queries.len(),
            has_next_page = output.next_token.is_some(),
            "Fetched metric data page"
        );

        Ok(ResultPage {
            rows,
            next_token: output.next_token,
        })
    }
}
