//! cloudwatch-forwarder - forward CloudWatch metrics to Mackerel
//!
//! Compiles user-declared metric specs into `GetMetricData` queries, pages
//! through the results, and posts the values to Mackerel as service or host
//! metrics. Values that fail to deliver are kept in a pending buffer and
//! retried on later invocations.

pub mod buffer;
pub mod cli;
pub mod cloudwatch;
pub mod config;
pub mod error;
pub mod extract;
pub mod forwarder;
pub mod handlers;
pub mod label;
pub mod mackerel;
pub mod metrics;
pub mod query;
pub mod retrieval;
pub mod secret;
pub mod telemetry;
