//! On-demand invocation endpoint
//!
//! `POST /forward` runs one invocation with the request body as the query
//! payload. An optional `X-Invocation-Timeout-Ms` header gives the caller's
//! remaining time; the forwarder subtracts its safety margin from it.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::AppResult;
use crate::handlers::AppState;

/// Header carrying the caller's remaining time in milliseconds
pub const TIMEOUT_HEADER: &str = "x-invocation-timeout-ms";

#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    pub status: &'static str,
    pub pending_values: usize,
}

pub async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<ForwardResponse>)> {
    let caller_deadline = headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    state
        .forwarder()
        .forward_metrics(&body, caller_deadline)
        .await?;

    Ok((
        StatusCode::OK,
        Json(ForwardResponse {
            status: "OK",
            pending_values: state.forwarder().pending_len().await,
        }),
    ))
}
