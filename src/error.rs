//! Error types for the forwarder
//!
//! Errors are split by phase: label decoding, metric retrieval, and delivery
//! each have their own type so callers can classify them. `AppError` wraps
//! them for the invocation-level result.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Reasons a routing label string can be rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("invalid label {label:?}: missing ':' separator before the metric name")]
    MissingSeparator { label: String },

    #[error("invalid label {label:?}: metric name is required")]
    EmptyMetricName { label: String },

    #[error("invalid label {label:?}: `service` or `host` is required")]
    MissingKind { label: String },

    #[error("invalid label {label:?}: either service name or host id is required")]
    EmptyDestination { label: String },

    #[error("invalid label {label:?}: unknown destination kind {kind:?}")]
    UnknownKind { label: String, kind: String },

    #[error("invalid label: destination id {id:?} must not contain ':'")]
    InvalidDestination { id: String },
}

/// Errors from the ingestion API client
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("status: {status}, {message}")]
    Api { status: u16, message: String },

    #[error("failed to reach ingestion API: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to serialize metric values: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid ingestion API URL {url:?}")]
    InvalidUrl { url: String },
}

impl DeliveryError {
    /// Whether another attempt may succeed
    ///
    /// 5xx and 429 responses and transport failures are retryable. Other
    /// statuses, serialization and URL errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Transport(_) => true,
            Self::Serialization(_) | Self::InvalidUrl { .. } => false,
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Errors from the metrics retrieval capability
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("failed to reach metrics provider: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("metrics provider returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode metrics provider response: {0}")]
    Decode(String),
}

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in {path}: {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Invalid query payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error("Metric retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Metric delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("API key for Mackerel is not found: {0}")]
    SecretNotFound(String),

    #[error("Failed to resolve API key for Mackerel: {0}")]
    Secret(String),

    #[error("Deadline exceeded after {timeout_ms} ms during {phase}")]
    DeadlineExceeded { phase: &'static str, timeout_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Retrieval(_) | Self::Delivery(_) | Self::Label(_) => StatusCode::BAD_GATEWAY,
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;
