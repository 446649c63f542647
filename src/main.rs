//! cloudwatch-forwarder binary
//!
//! Loads configuration, resolves the Mackerel API key and then forwards
//! metrics once or on a fixed interval. An optional Axum server exposes
//! health, metrics and on-demand invocation endpoints.

use clap::Parser;
use cloudwatch_forwarder::{
    cli::{Cli, Command, generate_config_template},
    cloudwatch::HttpMetricsRetrieval,
    config::{Config, ServerConfig},
    forwarder::Forwarder,
    handlers::{self, AppState},
    mackerel::MackerelClient,
    metrics::Metrics,
    secret::{AwsSecretResolver, resolve_api_key},
    telemetry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Command::Config { output }) = &cli.command {
        match output {
            Some(path) => {
                std::fs::write(path, generate_config_template())?;
                eprintln!("Wrote template configuration to {}", path);
            }
            None => print!("{}", generate_config_template()),
        }
        return Ok(());
    }

    let config = Config::from_file(&cli.config)?;
    telemetry::init(&config.observability.log_level);

    let request_timeout = Duration::from_secs(config.cloudwatch.request_timeout_seconds);
    let secrets = AwsSecretResolver::new(&config.secrets, request_timeout)?;
    let api_key = resolve_api_key(&config.mackerel, &secrets).await?;
    let mut client = MackerelClient::new(config.mackerel.base_url(), api_key)?
        .with_retry_policy(config.retry.policy()?);
    if let Some(user_agent) = config.mackerel.user_agent() {
        client = client.with_user_agent(user_agent);
    }

    let retrieval = HttpMetricsRetrieval::new(config.cloudwatch.endpoint.clone(), request_timeout)?;

    let metrics = Arc::new(Metrics::new()?);
    let forwarder = Arc::new(
        Forwarder::new(Arc::new(retrieval), client, config.forwarder.clone())
            .with_metrics(Arc::clone(&metrics)),
    );

    if let Some(server) = &config.server {
        let state = AppState::new(Arc::clone(&forwarder), Arc::clone(&metrics));
        spawn_server(server, state).await?;
    }

    match cli.command {
        Some(Command::Once { queries }) => {
            let path = queries.unwrap_or_else(|| config.forwarder.queries.clone());
            let payload = tokio::fs::read(&path).await?;
            forwarder.forward_metrics(&payload, None).await?;
            Ok(())
        }
        _ => {
            run_loop(&forwarder, &config.forwarder.queries).await;
            Ok(())
        }
    }
}

/// Invoke once per interval until Ctrl-C
async fn run_loop(forwarder: &Forwarder, queries: &str) {
    let mut ticker = tokio::time::interval(forwarder.config().interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_seconds = forwarder.config().interval_seconds,
        queries = %queries,
        "Starting forwarder loop"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(
                    pending = forwarder.pending_len().await,
                    "Shutting down"
                );
                return;
            }
        }

        // Re-read every tick so query edits apply without a restart
        let payload = match tokio::fs::read(queries).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(path = %queries, error = %e, "Failed to read query file");
                continue;
            }
        };

        if let Err(e) = forwarder.forward_metrics(&payload, None).await {
            tracing::error!(error = %e, "Invocation failed");
        }
    }
}

async fn spawn_server(
    server: &ServerConfig,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from((
        server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0])),
        server.port,
    ));

    let app = handlers::router(state).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);
    tracing::info!("Health check available at http://{}/health", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });
    Ok(())
}
