//! Keyed metric value sets
//!
//! [`MetricSet`] is both the accumulator the pager fills and the pending
//! buffer carried across invocations. Values are keyed by
//! (destination, metric name, timestamp); inserting an existing key overwrites
//! the value instead of adding a duplicate.

use crate::label::{Destination, Label};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value of a Mackerel service metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetricValue {
    pub name: String,
    pub time: i64,
    pub value: f64,
}

/// A value of a Mackerel host metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetricValue {
    #[serde(rename = "hostId")]
    pub host_id: String,
    pub name: String,
    pub time: i64,
    pub value: f64,
}

type SeriesKey = (String, i64);
type HostKey = (String, String, i64);

/// Metric values grouped by destination, deduplicated by key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSet {
    services: BTreeMap<String, BTreeMap<SeriesKey, f64>>,
    hosts: BTreeMap<HostKey, f64>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value routed by a decoded label
    pub fn insert(&mut self, label: &Label, time: i64, value: f64) {
        match label.destination() {
            Destination::Service(service) => {
                self.insert_service(service, label.metric_name(), time, value)
            }
            Destination::Host(host_id) => self.insert_host(host_id, label.metric_name(), time, value),
        }
    }

    pub fn insert_service(&mut self, service: &str, name: &str, time: i64, value: f64) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert((name.to_string(), time), value);
    }

    pub fn insert_host(&mut self, host_id: &str, name: &str, time: i64, value: f64) {
        self.hosts
            .insert((host_id.to_string(), name.to_string(), time), value);
    }

    /// Append a service batch (e.g. one that failed to deliver)
    pub fn append_service(&mut self, service: &str, values: Vec<ServiceMetricValue>) {
        for v in values {
            self.insert_service(service, &v.name, v.time, v.value);
        }
    }

    /// Append a host batch
    pub fn append_host(&mut self, values: Vec<HostMetricValue>) {
        for v in values {
            self.insert_host(&v.host_id, &v.name, v.time, v.value);
        }
    }

    /// Merge `other` into `self`; values from `other` win on identical keys
    pub fn merge(&mut self, other: MetricSet) {
        for (service, series) in other.services {
            self.services.entry(service).or_default().extend(series);
        }
        self.hosts.extend(other.hosts);
    }

    /// Remove every value with `time < threshold`
    ///
    /// Services left without values are removed entirely. Returns the number
    /// of values removed.
    pub fn drop_older_than(&mut self, threshold: i64) -> usize {
        let mut dropped = 0;

        let before = self.hosts.len();
        self.hosts.retain(|(_, _, time), _| *time >= threshold);
        dropped += before - self.hosts.len();

        for series in self.services.values_mut() {
            let before = series.len();
            series.retain(|(_, time), _| *time >= threshold);
            dropped += before - series.len();
        }
        self.services.retain(|_, series| !series.is_empty());

        dropped
    }

    /// Total number of values held
    pub fn len(&self) -> usize {
        self.hosts.len() + self.services.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.services.is_empty()
    }

    /// Names of services with at least one value
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Values of one service, ordered by (name, time)
    pub fn service_values(&self, service: &str) -> Vec<ServiceMetricValue> {
        self.services
            .get(service)
            .map(|series| series.iter().map(to_service_value).collect())
            .unwrap_or_default()
    }

    /// Host values, ordered by (host id, name, time)
    pub fn host_values(&self) -> Vec<HostMetricValue> {
        self.hosts.iter().map(to_host_value).collect()
    }

    /// Split into one batch per service plus the host batch
    pub fn into_batches(self) -> (Vec<(String, Vec<ServiceMetricValue>)>, Vec<HostMetricValue>) {
        let services = self
            .services
            .into_iter()
            .map(|(service, series)| (service, series.iter().map(to_service_value).collect()))
            .collect();
        let hosts = self.hosts.iter().map(to_host_value).collect();
        (services, hosts)
    }
}

fn to_service_value(((name, time), value): (&SeriesKey, &f64)) -> ServiceMetricValue {
    ServiceMetricValue {
        name: name.clone(),
        time: *time,
        value: *value,
    }
}

fn to_host_value(((host_id, name, time), value): (&HostKey, &f64)) -> HostMetricValue {
    HostMetricValue {
        host_id: host_id.clone(),
        name: name.clone(),
        time: *time,
        value: *value,
    }
}
