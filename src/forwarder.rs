//! Invocation orchestrator
//!
//! One invocation fetches fresh values for the query payload, then expires
//! stale pending values, merges both and delivers them concurrently: one task
//! per service plus one for host metrics. Batches that fail to deliver go back
//! into the pending buffer for the next invocation.
//!
//! Once values leave the pending buffer they are owned by a detached publish
//! task, so dropping an invocation future (a disconnected `/forward` caller,
//! an outer timeout) never loses them. The buffer lock is only held to take
//! values out and to put failed ones back.

use crate::buffer::{HostMetricValue, MetricSet, ServiceMetricValue};
use crate::config::ForwarderConfig;
use crate::error::{AppError, AppResult, DeliveryError};
use crate::extract::{FetchSummary, fetch_metrics};
use crate::mackerel::MackerelClient;
use crate::metrics::{BatchOutcome, DestinationKind, InvocationResult, Metrics};
use crate::query::{compile, parse_specs};
use crate::retrieval::{MetricsRetrieval, Window};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::Instrument;

/// A unit of delivery: everything for one destination
#[derive(Debug, Clone)]
enum Batch {
    Service {
        service: String,
        values: Vec<ServiceMetricValue>,
    },
    Host(Vec<HostMetricValue>),
}

impl Batch {
    fn kind(&self) -> DestinationKind {
        match self {
            Batch::Service { .. } => DestinationKind::Service,
            Batch::Host(_) => DestinationKind::Host,
        }
    }

    fn len(&self) -> usize {
        match self {
            Batch::Service { values, .. } => values.len(),
            Batch::Host(values) => values.len(),
        }
    }

    fn destination(&self) -> &str {
        match self {
            Batch::Service { service, .. } => service,
            Batch::Host(_) => "hosts",
        }
    }

    fn requeue_into(self, pending: &mut MetricSet) {
        match self {
            Batch::Service { service, values } => pending.append_service(&service, values),
            Batch::Host(values) => pending.append_host(values),
        }
    }
}

/// Everything the publish task needs, owned so it can outlive the invocation
struct Publish {
    client: Arc<MackerelClient>,
    pending: Arc<Mutex<MetricSet>>,
    metrics: Option<Arc<Metrics>>,
    fresh: MetricSet,
    expire_before: i64,
    deadline: Instant,
    fetch_ok: bool,
    started: std::time::Instant,
}

/// Forwards CloudWatch metrics to Mackerel, keeping undelivered values
/// between invocations
pub struct Forwarder {
    retrieval: Arc<dyn MetricsRetrieval>,
    client: Arc<MackerelClient>,
    pending: Arc<Mutex<MetricSet>>,
    config: ForwarderConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Forwarder {
    pub fn new(
        retrieval: Arc<dyn MetricsRetrieval>,
        client: MackerelClient,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            retrieval,
            client: Arc::new(client),
            pending: Arc::new(Mutex::new(MetricSet::new())),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Number of values waiting for the next invocation
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Deadline for one invocation
    ///
    /// A caller-supplied deadline is shrunk by the configured margin; without
    /// one the configured fallback applies from now.
    pub fn effective_deadline(&self, caller_deadline: Option<Instant>) -> Instant {
        match caller_deadline {
            Some(deadline) => deadline
                .checked_sub(self.config.deadline_margin())
                .unwrap_or_else(Instant::now),
            None => Instant::now() + self.config.deadline(),
        }
    }

    /// Deadline for the fetch phase: the invocation deadline minus the
    /// delivery reserve, never earlier than now
    pub fn fetch_deadline(&self, deadline: Instant) -> Instant {
        let now = Instant::now();
        deadline
            .checked_sub(self.config.delivery_reserve())
            .map_or(now, |fetch| fetch.max(now))
    }

    /// Run one invocation for `payload` (a JSON array of metric specs)
    ///
    /// Returns the fetch-phase error, if any, after delivery has been
    /// attempted. Delivery failures are never returned; their values are kept
    /// for the next invocation.
    pub async fn forward_metrics(
        &self,
        payload: &[u8],
        caller_deadline: Option<Instant>,
    ) -> AppResult<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AppError::Internal(format!("system clock before unix epoch: {}", e)))?
            .as_secs() as i64;
        self.forward_metrics_at(now, payload, caller_deadline).await
    }

    /// Same as [`Forwarder::forward_metrics`] with an explicit wall-clock time
    pub async fn forward_metrics_at(
        &self,
        now: i64,
        payload: &[u8],
        caller_deadline: Option<Instant>,
    ) -> AppResult<()> {
        let invocation_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("invocation", id = %invocation_id);
        self.invoke(now, payload, caller_deadline)
            .instrument(span)
            .await
    }

    async fn invoke(
        &self,
        now: i64,
        payload: &[u8],
        caller_deadline: Option<Instant>,
    ) -> AppResult<()> {
        let started = std::time::Instant::now();
        let deadline = self.effective_deadline(caller_deadline);
        let fetch_deadline = self.fetch_deadline(deadline);
        let budget_ms = fetch_deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;

        let window = Window::ending_before(now, self.config.ingestion_delay_seconds as i64);
        let mut fresh = MetricSet::new();
        let fetch_result = match tokio::time::timeout_at(
            fetch_deadline,
            self.fetch(payload, window, &mut fresh),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::DeadlineExceeded {
                phase: "fetch",
                timeout_ms: budget_ms,
            }),
        };

        match &fetch_result {
            Ok(summary) => {
                tracing::debug!(
                    pages = summary.pages,
                    values = summary.values,
                    defaults = summary.defaults_applied,
                    window_start = window.start,
                    window_end = window.end,
                    "Fetched metric values"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_fetch(summary.values, summary.defaults_applied);
                }
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    partial_values = fresh.len(),
                    "Fetching metric values failed, publishing what is available"
                );
            }
        }

        let publish = Publish {
            client: Arc::clone(&self.client),
            pending: Arc::clone(&self.pending),
            metrics: self.metrics.clone(),
            fresh,
            expire_before: now.saturating_sub(self.config.retention_seconds as i64),
            deadline,
            fetch_ok: fetch_result.is_ok(),
            started,
        };

        // Dropping the handle detaches the task; it still re-queues failures
        let handle = tokio::spawn(publish.run().in_current_span());
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Publish task failed to complete");
        }

        fetch_result.map(|_| ())
    }

    async fn fetch(
        &self,
        payload: &[u8],
        window: Window,
        into: &mut MetricSet,
    ) -> AppResult<FetchSummary> {
        let specs = parse_specs(payload)?;
        let batch = compile(&specs);
        if batch.is_empty() {
            tracing::info!(specs = specs.len(), "No queries to run");
            return Ok(FetchSummary::default());
        }
        fetch_metrics(self.retrieval.as_ref(), window, &batch, into).await
    }
}

impl Publish {
    async fn run(self) {
        let Publish {
            client,
            pending,
            metrics,
            fresh,
            expire_before,
            deadline,
            fetch_ok,
            started,
        } = self;

        let outgoing = {
            let mut pending = pending.lock().await;
            let expired = pending.drop_older_than(expire_before);
            if expired > 0 {
                tracing::info!(
                    expired = expired,
                    threshold = expire_before,
                    "Dropped pending values past retention"
                );
            }
            if let Some(metrics) = &metrics {
                metrics.record_expired(expired);
            }
            let mut outgoing = std::mem::take(&mut *pending);
            outgoing.merge(fresh);
            outgoing
        };
        let total = outgoing.len();

        let (services, hosts) = outgoing.into_batches();
        let mut batches: Vec<Arc<Batch>> = services
            .into_iter()
            .map(|(service, values)| Arc::new(Batch::Service { service, values }))
            .collect();
        if !hosts.is_empty() {
            batches.push(Arc::new(Batch::Host(hosts)));
        }

        let handles: Vec<_> = batches
            .iter()
            .map(|batch| {
                tokio::spawn(
                    deliver_batch(Arc::clone(&client), Arc::clone(batch), deadline)
                        .in_current_span(),
                )
            })
            .collect();
        let outcomes = join_all(handles).await;

        let mut delivered = 0;
        let mut failed = MetricSet::new();
        let mut failed_batches = 0;
        for (batch, joined) in batches.into_iter().zip(outcomes) {
            let outcome = joined.unwrap_or_else(|e| {
                tracing::error!(
                    destination = %batch.destination(),
                    error = %e,
                    "Delivery task failed to complete, keeping values for the next invocation"
                );
                BatchOutcome::Requeued
            });
            if let Some(metrics) = &metrics {
                metrics.record_batch(batch.kind(), outcome, batch.len());
            }
            if outcome == BatchOutcome::Delivered {
                delivered += batch.len();
            } else {
                failed_batches += 1;
                Arc::unwrap_or_clone(batch).requeue_into(&mut failed);
            }
        }

        let requeued = failed.len();
        let pending_now = {
            let mut pending = pending.lock().await;
            // Values added meanwhile by another invocation are newer and win
            failed.merge(std::mem::take(&mut *pending));
            *pending = failed;
            pending.len()
        };

        if let Some(metrics) = &metrics {
            metrics.set_pending(pending_now);
            let result = if fetch_ok {
                InvocationResult::Ok
            } else {
                InvocationResult::FetchFailed
            };
            metrics.record_invocation(result, started.elapsed().as_secs_f64());
        }

        tracing::info!(
            total = total,
            delivered = delivered,
            requeued = requeued,
            pending = pending_now,
            failed_batches = failed_batches,
            fetch_ok = fetch_ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Invocation finished"
        );
    }
}

async fn deliver_batch(
    client: Arc<MackerelClient>,
    batch: Arc<Batch>,
    deadline: Instant,
) -> BatchOutcome {
    let values = batch.len();

    let attempt = async {
        match batch.as_ref() {
            Batch::Service { service, values } => {
                client.post_service_metric_values(service, values).await
            }
            Batch::Host(values) => client.post_host_metric_values(values).await,
        }
    };

    let result: Result<(), Option<DeliveryError>> =
        match tokio::time::timeout_at(deadline, attempt).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Some(e)),
            Err(_) => Err(None),
        };

    match result {
        Ok(()) => {
            tracing::debug!(
                destination = %batch.destination(),
                values = values,
                "Delivered metric values"
            );
            BatchOutcome::Delivered
        }
        Err(Some(e)) => {
            tracing::error!(
                destination = %batch.destination(),
                values = values,
                error = %e,
                "Delivery failed, keeping values for the next invocation"
            );
            if e.is_retryable() {
                BatchOutcome::Requeued
            } else {
                BatchOutcome::Rejected
            }
        }
        Err(None) => {
            tracing::error!(
                destination = %batch.destination(),
                values = values,
                "Delivery hit the invocation deadline, keeping values for the next invocation"
            );
            BatchOutcome::Requeued
        }
    }
}
