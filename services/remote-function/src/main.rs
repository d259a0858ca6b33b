//! BigQuery remote function for the Claude Messages API
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Anthropic API keys
//! 2. Accepts BigQuery remote function batches on `POST /`
//! 3. Sends each row to the Messages API with a usable key, backing off while
//!    every key is rate limited
//! 4. Replies with one Messages API response per row, or a single error

mod config;
mod error;
mod metrics;
mod remote_function;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use credential_pool::CredentialPool;
use dispatch::{BatchCoordinator, Dispatcher, DispatcherConfig, RetryOrchestrator};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::remote_function::FunctionState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    function: FunctionState,
    pool: Arc<CredentialPool>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", post(remote_function_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Wire pool, dispatcher, orchestrator and coordinator from configuration.
fn build_state(config: &Config, prometheus: PrometheusHandle) -> AppState {
    let pool = Arc::new(CredentialPool::new(
        config
            .claude
            .api_keys
            .iter()
            .map(|key| key.expose().clone()),
    ));

    let dispatcher = Dispatcher::new(
        reqwest::Client::new(),
        pool.clone(),
        DispatcherConfig {
            base_url: config.claude.base_url.clone(),
            model: config.claude.model.clone(),
            api_version: config.claude.version.clone(),
            timeout: Duration::from_secs(config.claude.timeout_secs),
        },
    );
    let orchestrator = RetryOrchestrator::new(dispatcher, config.retry.policy());
    let coordinator = BatchCoordinator::new(orchestrator, config.batch.max_concurrency);

    AppState {
        function: FunctionState {
            coordinator: Arc::new(coordinator),
            metrics: ServiceMetrics::new(),
        },
        pool,
        prometheus,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting bq-claude-remote-function");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.claude.base_url,
        model = %config.claude.model,
        credentials = config.claude.api_keys.len(),
        max_attempts = config.retry.max_attempts,
        max_concurrency = config.batch.max_concurrency,
        "configuration loaded"
    );

    let app_state = build_state(&config, prometheus_handle);
    let in_flight = app_state.function.metrics.in_flight.clone();
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: notify the
    // server to drain, then race the drain against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool state plus uptime and request counters.
/// Returns 200 while at least one credential is usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.function.metrics;
    let mut body = state.pool.health();
    body["uptime_seconds"] = serde_json::json!(metrics.started_at.elapsed().as_secs());
    body["requests_served"] = serde_json::json!(metrics.requests_total.load(Ordering::Relaxed));
    body["errors_total"] = serde_json::json!(metrics.errors_total.load(Ordering::Relaxed));

    let usable = body["credentials_usable"].as_u64().unwrap_or(0);
    let status_code = if usable > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint; returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// BigQuery remote function entry point.
async fn remote_function_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    remote_function::handle(&state.function, &body, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
