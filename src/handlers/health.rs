//! Health check endpoint
//!
//! Provides a simple health check for monitoring and load balancers.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::handlers::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    /// Values waiting for the next invocation, as of the last one
    pub pending_values: i64,
}

/// Health check handler
///
/// Always 200 OK; the pending count is read from the metrics gauge so the
/// check never waits on a running invocation.
pub async fn handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "OK",
            pending_values: state.metrics().pending(),
        }),
    )
}
