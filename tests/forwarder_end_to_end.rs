//! End-to-end tests for the invocation orchestrator
//!
//! A scripted retrieval stands in for CloudWatch and a wiremock server for
//! the Mackerel API, so each test controls both sides of an invocation.

use async_trait::async_trait;
use cloudwatch_forwarder::config::ForwarderConfig;
use cloudwatch_forwarder::error::{AppError, RetrievalError};
use cloudwatch_forwarder::forwarder::Forwarder;
use cloudwatch_forwarder::mackerel::{MackerelClient, RetryPolicy};
use cloudwatch_forwarder::metrics::{DestinationKind, InvocationResult, Metrics};
use cloudwatch_forwarder::query::CompiledQuery;
use cloudwatch_forwarder::retrieval::{MetricsRetrieval, ResultPage, ResultRow, Window};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// 2024-01-01T00:10:42Z
const NOW: i64 = 1_704_067_842;
/// Window start for `NOW` with the default ingestion delay
const WINDOW_START: i64 = 1_704_067_620;

/// Serves queued pages in order, then empty pages
#[derive(Default)]
struct ScriptedRetrieval {
    pages: Mutex<Vec<Result<ResultPage, RetrievalError>>>,
    windows: Mutex<Vec<Window>>,
    /// Applied before every page
    delay: Mutex<Duration>,
}

impl ScriptedRetrieval {
    fn push(&self, page: Result<ResultPage, RetrievalError>) {
        self.pages.lock().unwrap().insert(0, page);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl MetricsRetrieval for ScriptedRetrieval {
    async fn fetch_page(
        &self,
        window: Window,
        _queries: &[CompiledQuery],
        _next_token: Option<&str>,
    ) -> Result<ResultPage, RetrievalError> {
        self.windows.lock().unwrap().push(window);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.pages
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Ok(ResultPage::default()))
    }
}

fn page(rows: Vec<(&str, Vec<(i64, f64)>)>) -> Result<ResultPage, RetrievalError> {
    Ok(ResultPage {
        rows: rows
            .into_iter()
            .map(|(label, points)| ResultRow {
                label: label.to_string(),
                timestamps: points.iter().map(|p| p.0).collect(),
                values: points.iter().map(|p| p.1).collect(),
            })
            .collect(),
        next_token: None,
    })
}

struct Harness {
    server: MockServer,
    retrieval: Arc<ScriptedRetrieval>,
    metrics: Arc<Metrics>,
    forwarder: Forwarder,
}

async fn harness() -> Harness {
    harness_with(ForwarderConfig::default()).await
}

async fn harness_with(config: ForwarderConfig) -> Harness {
    let server = MockServer::start().await;
    let retrieval = Arc::new(ScriptedRetrieval::default());
    let metrics = Arc::new(Metrics::new().unwrap());
    let client = MackerelClient::new(&server.uri(), "test-key")
        .unwrap()
        .with_retry_policy(RetryPolicy::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, 1).unwrap());
    let forwarder = Forwarder::new(
        Arc::clone(&retrieval) as Arc<dyn MetricsRetrieval>,
        client,
        config,
    )
    .with_metrics(Arc::clone(&metrics));
    Harness {
        server,
        retrieval,
        metrics,
        forwarder,
    }
}

async fn requests_to(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == route)
        .count()
}

const TWO_SERVICES: &str = r#"[
    {"service": "good", "name": "requests.sum", "metric": ["AWS/ApplicationELB", "RequestCount"], "stat": "Sum"},
    {"service": "bad", "name": "requests.sum", "metric": [".", "."], "stat": "."}
]"#;

#[tokio::test]
async fn test_default_value_emitted_at_window_start() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/svc/tsdb"))
        .and(body_json(json!([
            {"name": "errors", "time": WINDOW_START, "value": 0.0}
        ])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.server)
        .await;
    h.retrieval.push(page(vec![("service=svc:errors", vec![])]));

    let payload = br#"[{"service": "svc", "name": "errors", "metric": ["AWS/Lambda", "Errors"], "stat": "Sum", "default": 0}]"#;
    h.forwarder
        .forward_metrics_at(NOW, payload, None)
        .await
        .expect("invocation should succeed");

    assert_eq!(h.forwarder.pending_len().await, 0);
    let windows = h.retrieval.windows.lock().unwrap();
    assert_eq!(windows[0].start, WINDOW_START);
    assert_eq!(windows[0].end, WINDOW_START + 60);
}

#[tokio::test]
async fn test_host_values_routed_to_host_endpoint() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/api/v0/tsdb"))
        .and(body_json(json!([
            {"hostId": "h-1", "name": "cpu.max", "time": WINDOW_START, "value": 91.5}
        ])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.server)
        .await;
    h.retrieval
        .push(page(vec![("host=h-1:cpu.max", vec![(WINDOW_START, 91.5)])]));

    let payload = br#"[{"hostId": "h-1", "name": "cpu.max", "metric": ["AWS/EC2", "CPUUtilization", "InstanceId", "i-1"], "stat": "Maximum"}]"#;
    h.forwarder
        .forward_metrics_at(NOW, payload, None)
        .await
        .unwrap();
    assert_eq!(h.metrics.values_delivered_count(DestinationKind::Host), 1);
}

#[tokio::test]
async fn test_failed_destination_is_requeued_and_redelivered() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/good/tsdb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/bad/tsdb"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;
    h.retrieval.push(page(vec![
        ("service=good:requests.sum", vec![(WINDOW_START, 10.0)]),
        ("service=bad:requests.sum", vec![(WINDOW_START, 20.0)]),
    ]));

    h.forwarder
        .forward_metrics_at(NOW, TWO_SERVICES.as_bytes(), None)
        .await
        .expect("delivery failures are not invocation errors");

    assert_eq!(h.forwarder.pending_len().await, 1);
    assert_eq!(h.metrics.values_delivered_count(DestinationKind::Service), 1);
    assert_eq!(h.metrics.values_requeued_count(DestinationKind::Service), 1);
    assert_eq!(h.metrics.pending(), 1);

    // The API recovers; the next invocation carries the pending value
    h.server.reset().await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/bad/tsdb"))
        .and(body_json(json!([
            {"name": "requests.sum", "time": WINDOW_START, "value": 20.0}
        ])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.server)
        .await;

    h.forwarder
        .forward_metrics_at(NOW + 60, b"[]", None)
        .await
        .unwrap();
    assert_eq!(h.forwarder.pending_len().await, 0);
}

#[tokio::test]
async fn test_fresh_value_wins_over_pending() {
    let h = harness().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/svc/tsdb"))
        .and(body_json(json!([
            {"name": "m", "time": WINDOW_START, "value": 2.0}
        ])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.server)
        .await;
    let payload = br#"[{"service": "svc", "name": "m", "metric": ["NS", "M"], "stat": "Sum"}]"#;

    h.retrieval
        .push(page(vec![("service=svc:m", vec![(WINDOW_START, 1.0)])]));
    h.forwarder
        .forward_metrics_at(NOW, payload, None)
        .await
        .unwrap();
    assert_eq!(h.forwarder.pending_len().await, 1);

    // Late-arriving datapoint for the same key replaces the pending one
    h.retrieval
        .push(page(vec![("service=svc:m", vec![(WINDOW_START, 2.0)])]));
    h.forwarder
        .forward_metrics_at(NOW, payload, None)
        .await
        .unwrap();
    assert_eq!(h.forwarder.pending_len().await, 0);
}

#[tokio::test]
async fn test_fetch_error_still_publishes_pending() {
    let h = harness().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.server)
        .await;

    h.retrieval
        .push(page(vec![("service=svc:m", vec![(WINDOW_START, 1.0)])]));
    let payload = br#"[{"service": "svc", "name": "m", "metric": ["NS", "M"], "stat": "Sum"}]"#;
    h.forwarder
        .forward_metrics_at(NOW, payload, None)
        .await
        .unwrap();
    assert_eq!(h.forwarder.pending_len().await, 1);

    h.retrieval.push(Err(RetrievalError::Api {
        status: 500,
        message: "InternalFailure".to_string(),
    }));
    let result = h.forwarder.forward_metrics_at(NOW + 60, payload, None).await;

    assert!(matches!(result, Err(AppError::Retrieval(_))));
    assert_eq!(h.forwarder.pending_len().await, 0);
    assert_eq!(requests_to(&h.server, "/api/v0/services/svc/tsdb").await, 2);
    assert_eq!(
        h.metrics.invocations_count(InvocationResult::FetchFailed),
        1
    );
}

#[tokio::test]
async fn test_unparseable_payload_still_publishes_pending() {
    let h = harness().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.server)
        .await;

    h.retrieval
        .push(page(vec![("host=h-1:m", vec![(WINDOW_START, 1.0)])]));
    let payload = br#"[{"host": "h-1", "name": "m", "metric": ["NS", "M"], "stat": "Sum"}]"#;
    h.forwarder
        .forward_metrics_at(NOW, payload, None)
        .await
        .unwrap();
    assert_eq!(h.forwarder.pending_len().await, 1);

    let result = h
        .forwarder
        .forward_metrics_at(NOW + 60, b"{not json", None)
        .await;

    assert!(matches!(result, Err(AppError::InvalidPayload(_))));
    assert_eq!(h.forwarder.pending_len().await, 0);
    assert_eq!(requests_to(&h.server, "/api/v0/tsdb").await, 2);
}

#[tokio::test]
async fn test_pending_values_expire_after_retention() {
    let h = harness().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;

    h.retrieval
        .push(page(vec![("service=svc:m", vec![(WINDOW_START, 1.0)])]));
    let payload = br#"[{"service": "svc", "name": "m", "metric": ["NS", "M"], "stat": "Sum"}]"#;
    h.forwarder
        .forward_metrics_at(NOW, payload, None)
        .await
        .unwrap();
    assert_eq!(h.forwarder.pending_len().await, 1);

    let later = WINDOW_START + 6 * 60 * 60 + 1;
    h.forwarder
        .forward_metrics_at(later, b"[]", None)
        .await
        .unwrap();

    assert_eq!(h.forwarder.pending_len().await, 0);
    // Only the first invocation posted anything
    assert_eq!(requests_to(&h.server, "/api/v0/services/svc/tsdb").await, 1);
}

#[tokio::test]
async fn test_delivery_past_deadline_is_requeued() {
    let h = harness_with(ForwarderConfig {
        delivery_reserve_seconds: 0,
        ..ForwarderConfig::default()
    })
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&h.server)
        .await;

    h.retrieval
        .push(page(vec![("service=svc:m", vec![(WINDOW_START, 1.0)])]));
    let payload = br#"[{"service": "svc", "name": "m", "metric": ["NS", "M"], "stat": "Sum"}]"#;

    // 5s margin leaves 300ms for the invocation
    let caller_deadline = Instant::now() + Duration::from_millis(5_300);
    h.forwarder
        .forward_metrics_at(NOW, payload, Some(caller_deadline))
        .await
        .expect("a slow delivery is not an invocation error");

    assert_eq!(h.forwarder.pending_len().await, 1);
    assert_eq!(h.metrics.values_requeued_count(DestinationKind::Service), 1);
}

const ONE_SERVICE: &[u8] =
    br#"[{"service": "svc", "name": "m", "metric": ["NS", "M"], "stat": "Sum"}]"#;

/// First invocation fails delivery once, leaving one value pending
async fn seed_pending(h: &Harness) {
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    h.retrieval
        .push(page(vec![("service=svc:m", vec![(WINDOW_START, 1.0)])]));
    h.forwarder
        .forward_metrics_at(NOW, ONE_SERVICE, None)
        .await
        .unwrap();
    assert_eq!(h.forwarder.pending_len().await, 1);
}

#[tokio::test]
async fn test_slow_fetch_leaves_time_to_publish_pending() {
    let h = harness_with(ForwarderConfig {
        deadline_margin_seconds: 5,
        delivery_reserve_seconds: 2,
        ..ForwarderConfig::default()
    })
    .await;
    seed_pending(&h).await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/svc/tsdb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.server)
        .await;

    // 8s caller deadline: 3s invocation budget, of which the fetch gets 1s
    h.retrieval.set_delay(Duration::from_secs(60));
    let caller_deadline = Instant::now() + Duration::from_secs(8);
    let started = Instant::now();
    let result = h
        .forwarder
        .forward_metrics_at(NOW + 60, ONE_SERVICE, Some(caller_deadline))
        .await;

    assert!(matches!(
        result,
        Err(AppError::DeadlineExceeded { phase: "fetch", .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(h.forwarder.pending_len().await, 0);
    assert_eq!(requests_to(&h.server, "/api/v0/services/svc/tsdb").await, 2);
    assert_eq!(h.metrics.values_delivered_count(DestinationKind::Service), 1);
}

#[tokio::test]
async fn test_cancelled_invocation_keeps_undelivered_values() {
    let h = harness().await;
    seed_pending(&h).await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/svc/tsdb"))
        .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(500)))
        .mount(&h.server)
        .await;

    // The caller gives up while the pending value is in flight
    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        h.forwarder.forward_metrics_at(NOW + 60, b"[]", None),
    )
    .await;
    assert!(outcome.is_err());

    // The detached publish task still finishes and re-queues
    let give_up = Instant::now() + Duration::from_secs(5);
    while h.metrics.values_requeued_count(DestinationKind::Service) < 2 && Instant::now() < give_up
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(h.metrics.values_requeued_count(DestinationKind::Service), 2);
    assert_eq!(h.forwarder.pending_len().await, 1);
    assert_eq!(requests_to(&h.server, "/api/v0/services/svc/tsdb").await, 2);
}

#[tokio::test]
async fn test_cancelled_invocation_still_delivers() {
    let h = harness().await;
    seed_pending(&h).await;
    Mock::given(method("POST"))
        .and(path("/api/v0/services/svc/tsdb"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&h.server)
        .await;

    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        h.forwarder.forward_metrics_at(NOW + 60, b"[]", None),
    )
    .await;
    assert!(outcome.is_err());

    let give_up = Instant::now() + Duration::from_secs(5);
    while h.metrics.values_delivered_count(DestinationKind::Service) < 1 && Instant::now() < give_up
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(h.metrics.values_delivered_count(DestinationKind::Service), 1);
    assert_eq!(h.forwarder.pending_len().await, 0);
}

#[tokio::test]
async fn test_pending_buffer_readable_during_slow_fetch() {
    let h = harness().await;
    seed_pending(&h).await;
    h.retrieval.set_delay(Duration::from_secs(1));
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.server)
        .await;

    let (result, observed) = tokio::join!(
        h.forwarder.forward_metrics_at(NOW + 60, ONE_SERVICE, None),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::time::timeout(Duration::from_millis(200), h.forwarder.pending_len()).await
        }
    );

    result.unwrap();
    assert_eq!(observed.expect("pending buffer must not be locked by a fetch"), 1);
    assert_eq!(h.forwarder.pending_len().await, 0);
}
