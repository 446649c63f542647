//! Command-line interface for the forwarder
//!
//! Provides argument parsing and subcommand handling for the binary.

use clap::{Parser, Subcommand};

/// Forward CloudWatch metrics to Mackerel
#[derive(Parser)]
#[command(name = "cloudwatch-forwarder")]
#[command(version)]
#[command(about = "Forward CloudWatch metrics to Mackerel")]
#[command(
    long_about = "Fetches CloudWatch metrics described by a JSON query file once a minute and \
    posts them to Mackerel as service or host metrics. Values that fail to deliver are kept \
    and retried on the next invocation."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Forward metrics every interval until interrupted (default)
    Run,
    /// Run a single invocation and exit; fails if fetching failed
    Once {
        /// Query file to use instead of `forwarder.queries`
        #[arg(short, long)]
        queries: Option<String>,
    },
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# cloudwatch-forwarder configuration
# ==================================

# ─────────────────────────────────────────────────────────────────────────────
# MACKEREL
# ─────────────────────────────────────────────────────────────────────────────

[mackerel]
base_url = "https://api.mackerelio.com/"

# The API key comes from, in order: `api_key`, the parameter store entry
# `api_key_parameter`, the environment variable `api_key_env`, and the
# parameter named by MACKEREL_APIKEY_PARAMETER.
api_key_env = "MACKEREL_APIKEY"
# api_key = "..."
# api_key_parameter = "/mackerel/apikey"

# Treat the key as a base64 KMS ciphertext and read parameters with
# decryption. MACKEREL_APIKEY_WITH_DECRYPT=1 does the same.
# api_key_with_decrypt = false

# user_agent = "cloudwatch-forwarder"

# ─────────────────────────────────────────────────────────────────────────────
# CLOUDWATCH
# ─────────────────────────────────────────────────────────────────────────────

[cloudwatch]
# GetMetricData JSON endpoint. Requests are not signed; point this at a
# signing proxy or a local emulator.
endpoint = "http://127.0.0.1:4566/"
request_timeout_seconds = 30

# ─────────────────────────────────────────────────────────────────────────────
# SECRETS (Optional)
# ─────────────────────────────────────────────────────────────────────────────
#
# Parameter store and KMS endpoints, needed only for `api_key_parameter` or
# decryption. Unsigned, like the CloudWatch endpoint.

[secrets]
# ssm_endpoint = "http://127.0.0.1:4566/"
# kms_endpoint = "http://127.0.0.1:4566/"

# ─────────────────────────────────────────────────────────────────────────────
# DELIVERY RETRIES
# ─────────────────────────────────────────────────────────────────────────────
#
# Attempt n waits min(min_delay_ms * 2^(n-1), max_delay_ms) plus up to
# jitter_ms before attempt n+1. 5xx, 429 and network errors are retried.

[retry]
min_delay_ms = 100
max_delay_ms = 30000
jitter_ms = 1000
max_attempts = 10

# ─────────────────────────────────────────────────────────────────────────────
# FORWARDER
# ─────────────────────────────────────────────────────────────────────────────

[forwarder]
# JSON array of metric specs
queries = "queries.json"

# The query window ends this long before the current minute
ingestion_delay_seconds = 120

# Undelivered values older than this are dropped
retention_seconds = 21600

# Invocation budget, and the margin taken off a caller-supplied deadline
deadline_seconds = 50
deadline_margin_seconds = 5

# Part of the budget the fetch may not use, so pending values are still
# delivered when CloudWatch is slow. Must be less than deadline_seconds.
delivery_reserve_seconds = 10

# `run` invokes once per interval
interval_seconds = 60

# ─────────────────────────────────────────────────────────────────────────────
# SERVER (Optional)
# ─────────────────────────────────────────────────────────────────────────────
#
# Serves /health, /metrics and POST /forward.

# [server]
# host = "127.0.0.1"
# port = 9100

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error"
log_level = "info"
"#
}
