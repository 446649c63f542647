//! Prometheus metrics for the forwarder
//!
//! Tracks how many values were fetched, delivered, re-queued and expired, the
//! outcome of each delivery batch and invocation, and the pending buffer size.
//! Metrics are exposed via the `/metrics` endpoint in Prometheus text format.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Destination kind for type-safe metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Service,
    Host,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Service => "service",
            DestinationKind::Host => "host",
        }
    }
}

/// Outcome of one delivery batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Delivered,
    /// Retry budget exhausted or deadline reached; values re-queued
    Requeued,
    /// Rejected by the ingestion API; values re-queued
    Rejected,
}

impl BatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOutcome::Delivered => "delivered",
            BatchOutcome::Requeued => "requeued",
            BatchOutcome::Rejected => "rejected",
        }
    }
}

/// Result of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationResult {
    Ok,
    FetchFailed,
}

impl InvocationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationResult::Ok => "ok",
            InvocationResult::FetchFailed => "fetch_failed",
        }
    }
}

/// Metrics collector for the forwarder
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    values_fetched: IntCounter,
    defaults_applied: IntCounter,
    values_expired: IntCounter,
    values_delivered: IntCounterVec,
    values_requeued: IntCounterVec,
    batches: IntCounterVec,
    invocations: IntCounterVec,
    pending_values: IntGauge,
    invocation_duration: Histogram,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let values_fetched = IntCounter::with_opts(Opts::new(
            "cloudwatch_forwarder_values_fetched_total",
            "Datapoints read from CloudWatch result pages",
        ))?;
        let defaults_applied = IntCounter::with_opts(Opts::new(
            "cloudwatch_forwarder_defaults_applied_total",
            "Default values emitted for series without datapoints",
        ))?;
        let values_expired = IntCounter::with_opts(Opts::new(
            "cloudwatch_forwarder_values_expired_total",
            "Pending values dropped for exceeding the retention horizon",
        ))?;

        // Cardinality: 2 destination kinds
        let values_delivered = IntCounterVec::new(
            Opts::new(
                "cloudwatch_forwarder_values_delivered_total",
                "Values accepted by the Mackerel API",
            ),
            &["destination_kind"],
        )?;
        let values_requeued = IntCounterVec::new(
            Opts::new(
                "cloudwatch_forwarder_values_requeued_total",
                "Values put back into the pending buffer after a failed delivery",
            ),
            &["destination_kind"],
        )?;

        // Cardinality: 2 destination kinds × 3 outcomes
        let batches = IntCounterVec::new(
            Opts::new(
                "cloudwatch_forwarder_batches_total",
                "Delivery batches by destination kind and outcome",
            ),
            &["destination_kind", "outcome"],
        )?;
        let invocations = IntCounterVec::new(
            Opts::new(
                "cloudwatch_forwarder_invocations_total",
                "Forwarding invocations by result",
            ),
            &["result"],
        )?;

        let pending_values = IntGauge::with_opts(Opts::new(
            "cloudwatch_forwarder_pending_values",
            "Values waiting in the pending buffer for the next invocation",
        ))?;

        let invocation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cloudwatch_forwarder_invocation_duration_seconds",
                "Wall time of one forwarding invocation",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(values_fetched.clone()))?;
        registry.register(Box::new(defaults_applied.clone()))?;
        registry.register(Box::new(values_expired.clone()))?;
        registry.register(Box::new(values_delivered.clone()))?;
        registry.register(Box::new(values_requeued.clone()))?;
        registry.register(Box::new(batches.clone()))?;
        registry.register(Box::new(invocations.clone()))?;
        registry.register(Box::new(pending_values.clone()))?;
        registry.register(Box::new(invocation_duration.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            values_fetched,
            defaults_applied,
            values_expired,
            values_delivered,
            values_requeued,
            batches,
            invocations,
            pending_values,
            invocation_duration,
        })
    }

    pub fn record_fetch(&self, values: usize, defaults: usize) {
        self.values_fetched.inc_by(values as u64);
        self.defaults_applied.inc_by(defaults as u64);
    }

    pub fn record_expired(&self, count: usize) {
        self.values_expired.inc_by(count as u64);
    }

    /// Record the outcome of one delivery batch of `values` values
    pub fn record_batch(&self, kind: DestinationKind, outcome: BatchOutcome, values: usize) {
        self.batches
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .inc();
        let counter = match outcome {
            BatchOutcome::Delivered => &self.values_delivered,
            BatchOutcome::Requeued | BatchOutcome::Rejected => &self.values_requeued,
        };
        counter
            .with_label_values(&[kind.as_str()])
            .inc_by(values as u64);
    }

    pub fn record_invocation(&self, result: InvocationResult, duration_seconds: f64) {
        self.invocations.with_label_values(&[result.as_str()]).inc();
        if duration_seconds.is_finite() && duration_seconds >= 0.0 {
            self.invocation_duration.observe(duration_seconds);
        }
    }

    pub fn set_pending(&self, values: usize) {
        self.pending_values.set(values as i64);
    }

    pub fn pending(&self) -> i64 {
        self.pending_values.get()
    }

    pub fn values_delivered_count(&self, kind: DestinationKind) -> u64 {
        self.values_delivered.with_label_values(&[kind.as_str()]).get()
    }

    pub fn values_requeued_count(&self, kind: DestinationKind) -> u64 {
        self.values_requeued.with_label_values(&[kind.as_str()]).get()
    }

    pub fn invocations_count(&self, result: InvocationResult) -> u64 {
        self.invocations.with_label_values(&[result.as_str()]).get()
    }

    /// Gather all metrics in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if metric encoding fails.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            tracing::error!(
                error = %e,
                metric_family_count = metric_families.len(),
                "Prometheus text encoder failed"
            );
            e
        })?;

        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!(
                "Failed to convert metrics to UTF-8 at byte {}: {}",
                e.utf8_error().valid_up_to(),
                e
            ))
        })
    }
}
