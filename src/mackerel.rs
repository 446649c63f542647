//! Mackerel ingestion client with retry support
//!
//! Posts service and host metric values to the Mackerel API. Failed attempts
//! are retried with capped exponential backoff plus jitter when the failure is
//! retryable (5xx, 429, transport errors); other failures return immediately.

use crate::buffer::{HostMetricValue, ServiceMetricValue};
use crate::error::{AppError, AppResult, DeliveryError};
use rand::Rng;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

/// Default Mackerel API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.mackerelio.com/";
/// Timeout applied to each attempt
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default first backoff delay (doubles each retry)
pub const DEFAULT_MIN_DELAY_MS: u64 = 100;
/// Default backoff cap
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter span added on top of the backoff
pub const DEFAULT_JITTER_MS: u64 = 1_000;
/// Default total number of attempts
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Backoff parameters for delivery retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    min_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
    max_attempts: usize,
}

impl RetryPolicy {
    /// Create a retry policy
    ///
    /// # Errors
    /// Returns an error if `max_attempts` is 0 or `min_delay` exceeds `max_delay`.
    pub fn new(
        min_delay: Duration,
        max_delay: Duration,
        jitter: Duration,
        max_attempts: usize,
    ) -> Result<Self, &'static str> {
        if max_attempts == 0 {
            return Err("max_attempts must be at least 1");
        }
        if min_delay > max_delay {
            return Err("min_delay must not exceed max_delay");
        }
        Ok(Self {
            min_delay,
            max_delay,
            jitter,
            max_attempts,
        })
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Backoff before the attempt following `attempt` (1-indexed), without jitter
    ///
    /// `min_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = (attempt as u32).saturating_sub(1);
        let base_ms = self.min_delay.as_millis().min(u64::MAX as u128) as u64;
        let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Backoff plus a uniformly random jitter in `[0, jitter)`
    pub fn delay_with_jitter(&self, attempt: usize) -> Duration {
        let jitter_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(DEFAULT_MIN_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: Duration::from_millis(DEFAULT_JITTER_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Tiny client for the Mackerel metric APIs
#[derive(Debug, Clone)]
pub struct MackerelClient {
    base_url: Url,
    api_key: String,
    user_agent: String,
    retry_policy: RetryPolicy,
    http: reqwest::Client,
}

impl MackerelClient {
    /// Create a client for `base_url` authenticated with `api_key`
    pub fn new(base_url: &str, api_key: impl Into<String>) -> AppResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid Mackerel base URL {:?}: {}", base_url, e)))?;
        let http = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            user_agent: default_user_agent(),
            retry_policy: RetryPolicy::default(),
            http,
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Post values of one service's metrics
    pub async fn post_service_metric_values(
        &self,
        service: &str,
        values: &[ServiceMetricValue],
    ) -> Result<(), DeliveryError> {
        if values.is_empty() {
            return Ok(());
        }
        let url = self.url_for(&["api", "v0", "services", service, "tsdb"])?;
        self.post_json(url, values).await
    }

    /// Post values of host metrics
    pub async fn post_host_metric_values(
        &self,
        values: &[HostMetricValue],
    ) -> Result<(), DeliveryError> {
        if values.is_empty() {
            return Ok(());
        }
        let url = self.url_for(&["api", "v0", "tsdb"])?;
        self.post_json(url, values).await
    }

    fn url_for(&self, segments: &[&str]) -> Result<Url, DeliveryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DeliveryError::InvalidUrl {
                url: self.base_url.to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: Url,
        payload: &T,
    ) -> Result<(), DeliveryError> {
        // Serialization failures are never retried
        let body = serde_json::to_vec(payload)?;
        let max_attempts = self.retry_policy.max_attempts();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.send_once(&url, &body).await {
                Ok(()) => {
                    tracing::debug!(
                        url = %url,
                        attempt = attempt,
                        bytes = body.len(),
                        "Posted metric values"
                    );
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(
                        url = %url,
                        attempt = attempt,
                        error = %e,
                        "Ingestion API rejected metric values, not retrying"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        url = %url,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Posting metric values failed, will retry"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry_policy.delay_with_jitter(attempt)).await;
                    }
                }
            }
        }

        tracing::error!(
            url = %url,
            max_attempts = max_attempts,
            "All delivery attempts exhausted"
        );
        // max_attempts >= 1 and every loop iteration either returns or sets last_error
        Err(last_error.unwrap_or(DeliveryError::InvalidUrl {
            url: url.to_string(),
        }))
    }

    async fn send_once(&self, url: &Url, body: &[u8]) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(url.clone())
            .header("X-Api-Key", &self.api_key)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(DeliveryError::Transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(DeliveryError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn default_user_agent() -> String {
    format!("cloudwatch-forwarder/{}", env!("CARGO_PKG_VERSION"))
}
