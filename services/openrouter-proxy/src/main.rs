//! OpenRouter key-rotating proxy
//!
//! Single-binary service that:
//! 1. Listens for OpenAI-compatible API requests under /api/v1
//! 2. Authenticates clients against a local access key
//! 3. Attaches one key from a pool of OpenRouter API keys per attempt
//! 4. Rotates to the next key when the current one is rate limited

mod auth;
mod config;
mod metrics;
mod proxy;
mod relay;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::relay::Dispatcher;
use keypool::KeyPool;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Build the upstream HTTP client from config: connect timeout plus an
/// optional forward proxy for egress. No overall request timeout — streaming
/// completions can legitimately run for minutes.
fn build_client(config: &Config) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.openrouter.connect_timeout_secs));
    if let Some(proxy_url) = &config.openrouter.forward_proxy {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("invalid forward_proxy url: {proxy_url}"))?,
        );
    }
    builder.build().context("failed to build HTTP client")
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

    info!("starting openrouter-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        base_url = %config.openrouter.base_url,
        keys = config.openrouter.keys.len(),
        strategy = ?config.openrouter.strategy,
        cooldown_secs = config.openrouter.cooldown_secs,
        free_models_only = config.openrouter.free_models_only,
        "configuration loaded"
    );

    let pool = KeyPool::new(
        config.pool_keys(),
        Duration::from_secs(config.openrouter.cooldown_secs),
    )
    .context("failed to build key pool")?;

    let client = build_client(&config)?;
    let dispatcher = Dispatcher::new(
        client,
        Duration::from_secs(config.openrouter.google_rate_delay_secs),
    );

    let app_state = AppState {
        proxy: ProxyState::new(&config, dispatcher, pool),
        prometheus: prometheus_handle,
    };

    let listen_addr = config.server.listen_addr;
    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT bounds the drain so a slow client cannot block exit
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
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness endpoint: always 200 with a fixed body. Pool state is not part
/// of liveness — an exhausted pool is a draining condition, not a dead
/// process — so orchestrators keep the instance running while keys cool down.
async fn health_handler() -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
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

/// Catch-all handler that routes API requests through the key pool.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
