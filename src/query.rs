//! Query compiler
//!
//! Turns the user-supplied list of [`MetricSpec`]s into CloudWatch
//! `MetricDataQuery` entries. Each query carries an encoded [`Label`] so the
//! result rows can be routed back to their Mackerel destination, and specs
//! with a `default` register it under that label.
//!
//! A token equal to [`REPEAT_PREVIOUS`] (`"."`) reuses the last concrete value
//! seen in the same position. The compiler is a pure function: no I/O happens
//! here.

use crate::error::{AppError, AppResult};
use crate::label::Label;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Token meaning "reuse the previous spec's value in this position"
pub const REPEAT_PREVIOUS: &str = ".";

/// Namespace + MetricName + 10 dimension name/value pairs
pub const METRIC_SLOTS: usize = 22;

/// Evaluation period of every compiled query, in seconds
pub const PERIOD_SECONDS: u32 = 60;

/// One user-declared metric to forward
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MetricSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(
        default,
        rename = "hostId",
        alias = "host",
        skip_serializing_if = "Option::is_none"
    )]
    pub host_id: Option<String>,
    #[serde(default)]
    pub name: String,
    /// Namespace, metric name, then dimension name/value pairs
    #[serde(default)]
    pub metric: Vec<serde_json::Value>,
    #[serde(default)]
    pub stat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
}

/// Parse a raw query payload (a JSON array of specs)
pub fn parse_specs(payload: &[u8]) -> AppResult<Vec<MetricSpec>> {
    serde_json::from_slice(payload).map_err(AppError::InvalidPayload)
}

/// A CloudWatch dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// Provider-side metric identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderMetric {
    pub namespace: String,
    pub metric_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricStat {
    pub metric: ProviderMetric,
    pub period: u32,
    pub stat: String,
}

/// One entry of a `GetMetricData` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompiledQuery {
    /// `m<N>`, unique within the batch
    pub id: String,
    /// Encoded routing label
    pub label: String,
    pub metric_stat: MetricStat,
}

/// Output of [`compile`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledBatch {
    pub queries: Vec<CompiledQuery>,
    /// Default values keyed by encoded label
    pub defaults: HashMap<String, f64>,
}

impl CompiledBatch {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Last concrete value seen per position, used to resolve [`REPEAT_PREVIOUS`]
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    host: String,
    service: String,
    stat: String,
    metric: [String; METRIC_SLOTS],
}

fn resolve(token: &str, last: &mut String) -> String {
    if token == REPEAT_PREVIOUS {
        last.clone()
    } else {
        *last = token.to_string();
        token.to_string()
    }
}

fn token_to_string(token: Option<&serde_json::Value>) -> String {
    match token {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Compile specs into provider queries
///
/// Specs naming both or neither of service/host, or producing an invalid
/// label, are skipped with a warning. Ids count emitted queries only.
pub fn compile(specs: &[MetricSpec]) -> CompiledBatch {
    let mut slots = SlotTable::default();
    let mut batch = CompiledBatch::default();

    for (index, spec) in specs.iter().enumerate() {
        let Some((label, metric_stat)) = compile_spec(index, spec, &mut slots) else {
            continue;
        };

        let id = format!("m{}", batch.queries.len() + 1);
        let label = label.encode();
        tracing::debug!(
            index = index,
            id = %id,
            label = %label,
            namespace = %metric_stat.metric.namespace,
            metric_name = %metric_stat.metric.metric_name,
            dimensions = metric_stat.metric.dimensions.len(),
            stat = %metric_stat.stat,
            "New metric data query"
        );

        if let Some(default) = spec.default {
            batch.defaults.insert(label.clone(), default);
        }
        batch.queries.push(CompiledQuery {
            id,
            label,
            metric_stat,
        });
    }

    batch
}

fn compile_spec(
    index: usize,
    spec: &MetricSpec,
    slots: &mut SlotTable,
) -> Option<(Label, MetricStat)> {
    let host = resolve(spec.host_id.as_deref().unwrap_or(""), &mut slots.host);
    let service = resolve(spec.service.as_deref().unwrap_or(""), &mut slots.service);
    let stat = resolve(&spec.stat, &mut slots.stat);

    if host.is_empty() == service.is_empty() {
        tracing::warn!(
            index = index,
            host = %host,
            service = %service,
            "Either service name or host id is required but not both, skipping"
        );
        return None;
    }

    if spec.metric.len() < 2 {
        tracing::warn!(
            index = index,
            tokens = spec.metric.len(),
            "At least namespace and metric name are required"
        );
    }

    let namespace = resolve(&token_to_string(spec.metric.first()), &mut slots.metric[0]);
    let metric_name = resolve(&token_to_string(spec.metric.get(1)), &mut slots.metric[1]);

    let mut dimensions = Vec::new();
    let mut j = 2;
    while j + 1 < spec.metric.len() {
        if j + 1 >= METRIC_SLOTS {
            tracing::warn!(
                index = index,
                max_dimensions = (METRIC_SLOTS - 2) / 2,
                "Too many dimensions, ignoring the rest"
            );
            break;
        }
        let name = resolve(&token_to_string(spec.metric.get(j)), &mut slots.metric[j]);
        let value = resolve(
            &token_to_string(spec.metric.get(j + 1)),
            &mut slots.metric[j + 1],
        );
        dimensions.push(Dimension { name, value });
        j += 2;
    }

    let label = if service.is_empty() {
        Label::host(host, spec.name.clone())
    } else {
        Label::service(service, spec.name.clone())
    };
    let label = match label {
        Ok(label) => label,
        Err(e) => {
            tracing::warn!(index = index, error = %e, "Cannot build routing label, skipping");
            return None;
        }
    };

    let metric_stat = MetricStat {
        metric: ProviderMetric {
            namespace,
            metric_name,
            dimensions,
        },
        period: PERIOD_SECONDS,
        stat,
    };
    Some((label, metric_stat))
}
