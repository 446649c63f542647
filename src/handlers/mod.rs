//! HTTP handlers for the forwarder's operational endpoints

use crate::forwarder::Forwarder;
use crate::metrics::Metrics;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

pub mod forward;
pub mod health;
pub mod metrics;

/// Application state shared across all handlers
///
/// All fields are Arc'd for cheap cloning across Axum handlers.
#[derive(Clone)]
pub struct AppState {
    forwarder: Arc<Forwarder>,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(forwarder: Arc<Forwarder>, metrics: Arc<Metrics>) -> Self {
        Self { forwarder, metrics }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Routes served by the optional HTTP server
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::handler))
        .route("/metrics", get(metrics::handler))
        .route("/forward", post(forward::handler))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ForwarderConfig;
    use crate::error::RetrievalError;
    use crate::mackerel::MackerelClient;
    use crate::query::CompiledQuery;
    use crate::retrieval::{MetricsRetrieval, ResultPage, Window};
    use async_trait::async_trait;

    struct EmptyRetrieval;

    #[async_trait]
    impl MetricsRetrieval for EmptyRetrieval {
        async fn fetch_page(
            &self,
            _window: Window,
            _queries: &[CompiledQuery],
            _next_token: Option<&str>,
        ) -> Result<ResultPage, RetrievalError> {
            Ok(ResultPage::default())
        }
    }

    pub(crate) fn create_test_state() -> AppState {
        let metrics = Arc::new(Metrics::new().expect("should create metrics"));
        let client = MackerelClient::new("http://127.0.0.1:9/", "key").expect("valid client");
        let forwarder = Forwarder::new(Arc::new(EmptyRetrieval), client, ForwarderConfig::default())
            .with_metrics(Arc::clone(&metrics));
        AppState::new(Arc::new(forwarder), metrics)
    }
}
