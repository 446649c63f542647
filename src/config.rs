//! Configuration management for the forwarder
//!
//! Parses TOML configuration files and provides typed access to settings.

use crate::error::{AppError, AppResult};
use crate::mackerel::{self, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub mackerel: MackerelConfig,
    pub cloudwatch: CloudWatchConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Mackerel ingestion API settings
///
/// Fields are private; the API key in particular should only be read through
/// [`crate::secret::resolve_api_key`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MackerelConfig {
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default, skip_serializing)]
    api_key: Option<String>,
    /// Parameter store name holding the API key when `api_key` is not set
    #[serde(default)]
    api_key_parameter: Option<String>,
    /// Treat `api_key` (or the environment key) as a base64 KMS ciphertext,
    /// and ask the parameter store for the decrypted value
    #[serde(default)]
    api_key_with_decrypt: bool,
    /// Environment variable holding the API key when nothing above is set
    #[serde(default = "default_api_key_env")]
    api_key_env: String,
    #[serde(default)]
    user_agent: Option<String>,
}

impl MackerelConfig {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn api_key_parameter(&self) -> Option<&str> {
        self.api_key_parameter.as_deref()
    }

    pub fn api_key_with_decrypt(&self) -> bool {
        self.api_key_with_decrypt
    }

    pub fn api_key_env(&self) -> &str {
        &self.api_key_env
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }
}

impl Default for MackerelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_parameter: None,
            api_key_with_decrypt: false,
            api_key_env: default_api_key_env(),
            user_agent: None,
        }
    }
}

fn default_base_url() -> String {
    mackerel::DEFAULT_BASE_URL.to_string()
}

fn default_api_key_env() -> String {
    "MACKEREL_APIKEY".to_string()
}

/// CloudWatch `GetMetricData` endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudWatchConfig {
    pub endpoint: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    30
}

/// Parameter store and key management endpoints used for API key resolution
///
/// Both speak the AWS JSON protocol; signing is left to the endpoint, as for
/// [`CloudWatchConfig`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub ssm_endpoint: Option<String>,
    #[serde(default)]
    pub kms_endpoint: Option<String>,
}

/// Delivery retry settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl RetryConfig {
    /// Build the validated retry policy
    pub fn policy(&self) -> AppResult<RetryPolicy> {
        RetryPolicy::new(
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            Duration::from_millis(self.jitter_ms),
            self.max_attempts,
        )
        .map_err(|e| AppError::Config(format!("retry: {}", e)))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_min_delay_ms() -> u64 {
    mackerel::DEFAULT_MIN_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    mackerel::DEFAULT_MAX_DELAY_MS
}

fn default_jitter_ms() -> u64 {
    mackerel::DEFAULT_JITTER_MS
}

fn default_max_attempts() -> usize {
    mackerel::DEFAULT_MAX_ATTEMPTS
}

/// Invocation scheduling and buffering settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwarderConfig {
    /// Path to the JSON array of metric specs
    #[serde(default = "default_queries")]
    pub queries: String,
    /// How far behind the current minute the query window ends
    #[serde(default = "default_ingestion_delay")]
    pub ingestion_delay_seconds: u64,
    /// Pending values older than this are dropped
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    /// Invocation deadline used when the caller gives none
    #[serde(default = "default_deadline")]
    pub deadline_seconds: u64,
    /// Subtracted from a caller-supplied deadline
    #[serde(default = "default_deadline_margin")]
    pub deadline_margin_seconds: u64,
    /// Part of the invocation deadline the fetch may not use, so pending
    /// values still get a delivery attempt when the fetch is slow
    #[serde(default = "default_delivery_reserve")]
    pub delivery_reserve_seconds: u64,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
}

impl ForwarderConfig {
    pub fn ingestion_delay(&self) -> Duration {
        Duration::from_secs(self.ingestion_delay_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_seconds)
    }

    pub fn deadline_margin(&self) -> Duration {
        Duration::from_secs(self.deadline_margin_seconds)
    }

    pub fn delivery_reserve(&self) -> Duration {
        Duration::from_secs(self.delivery_reserve_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queries: default_queries(),
            ingestion_delay_seconds: default_ingestion_delay(),
            retention_seconds: default_retention(),
            deadline_seconds: default_deadline(),
            deadline_margin_seconds: default_deadline_margin(),
            delivery_reserve_seconds: default_delivery_reserve(),
            interval_seconds: default_interval(),
        }
    }
}

fn default_queries() -> String {
    "queries.json".to_string()
}

fn default_ingestion_delay() -> u64 {
    120
}

fn default_retention() -> u64 {
    6 * 60 * 60
}

fn default_deadline() -> u64 {
    50
}

fn default_deadline_margin() -> u64 {
    5
}

fn default_delivery_reserve() -> u64 {
    10
}

fn default_interval() -> u64 {
    60
}

/// Health and metrics server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            }
        })?;

        let config: Self =
            toml::from_str(&content).map_err(|source| AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            })?;

        config
            .validate()
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Validate configuration after parsing
    ///
    /// Called by `from_file()`; call it explicitly when building a Config
    /// another way.
    pub fn validate(&self) -> AppResult<()> {
        let optional_urls = [
            ("secrets.ssm_endpoint", self.secrets.ssm_endpoint.as_deref()),
            ("secrets.kms_endpoint", self.secrets.kms_endpoint.as_deref()),
        ];
        for (name, url) in [
            ("mackerel.base_url", self.mackerel.base_url()),
            ("cloudwatch.endpoint", self.cloudwatch.endpoint.as_str()),
        ]
        .into_iter()
        .chain(
            optional_urls
                .into_iter()
                .filter_map(|(name, url)| url.map(|url| (name, url))),
        ) {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(AppError::Config(format!(
                    "{} must start with 'http://' or 'https://', got '{}'",
                    name, url
                )));
            }
        }

        if self.mackerel.api_key_env().is_empty()
            && self.mackerel.api_key().is_none()
            && self.mackerel.api_key_parameter().is_none()
        {
            return Err(AppError::Config(
                "one of mackerel.api_key, mackerel.api_key_parameter or mackerel.api_key_env must be set"
                    .to_string(),
            ));
        }

        if self.cloudwatch.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "cloudwatch.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        self.retry.policy()?;

        let forwarder = &self.forwarder;
        if forwarder.deadline_seconds == 0 {
            return Err(AppError::Config(
                "forwarder.deadline_seconds must be greater than 0".to_string(),
            ));
        }
        if forwarder.delivery_reserve_seconds >= forwarder.deadline_seconds {
            return Err(AppError::Config(format!(
                "forwarder.delivery_reserve_seconds ({}) must be less than forwarder.deadline_seconds ({})",
                forwarder.delivery_reserve_seconds, forwarder.deadline_seconds
            )));
        }
        if forwarder.interval_seconds == 0 {
            return Err(AppError::Config(
                "forwarder.interval_seconds must be greater than 0".to_string(),
            ));
        }
        if forwarder.retention_seconds == 0 {
            return Err(AppError::Config(
                "forwarder.retention_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
