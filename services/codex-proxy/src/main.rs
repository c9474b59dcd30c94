//! Codex multi-account proxy
//!
//! Single-binary Rust service that:
//! 1. Loads the account pool and usage snapshots from disk
//! 2. Listens for Responses API requests from a local client
//! 3. Picks an account, keeps its token fresh, and forwards to the ChatGPT
//!    backend, failing over on rate limits and credential errors
//! 4. Optionally serves an admin/status API on a second listener

mod admin;
mod config;
mod dialect;
mod metrics;
mod notice;
mod orchestrator;
mod proxy;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::AccountStore;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use codex_auth::HttpTokenRefresher;
use common::Clock;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::ReqwestTransport;
use usage_tracker::UsageTracker;

use crate::admin::{AdminState, ForeignSource, build_admin_router};
use crate::config::Config;
use crate::notice::NoticeBoard;
use crate::orchestrator::Orchestrator;

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    store: Arc<AccountStore>,
    prometheus: PrometheusHandle,
    started_at: Instant,
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

    info!("starting codex-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

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
        listen_addr = %config.proxy.listen_addr,
        admin_addr = ?config.proxy.admin_addr,
        upstream_url = %config.proxy.upstream_url,
        strategy = config.pool.strategy.as_str(),
        accounts_path = %config.storage.accounts_path.display(),
        "configuration loaded"
    );

    let clock = Clock::System;
    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let refresher = Arc::new(HttpTokenRefresher::new(http_client.clone()));
    let store = Arc::new(
        AccountStore::load(
            config.storage.accounts_path.clone(),
            config.pool.pool_config(),
            refresher,
            clock.clone(),
        )
        .await,
    );

    let foreign = config
        .storage
        .foreign_credentials_path
        .clone()
        .map(|path| ForeignSource {
            path,
            provider_key: config.storage.foreign_provider_key.clone(),
        });
    if let Some(source) = &foreign
        && store
            .import_foreign_credential(&source.path, &source.provider_key)
            .await
    {
        info!(path = %source.path.display(), "imported foreign credential");
    }
    if store.is_empty().await {
        warn!("account pool is empty; requests will fail until an account is added");
    }

    let usage = Arc::new(
        UsageTracker::load(
            config.storage.usage_path.clone(),
            config.usage.usage_config(),
            clock.clone(),
        )
        .await,
    );

    let transport: Arc<dyn upstream::Transport> = Arc::new(ReqwestTransport::new(
        http_client,
        Duration::from_secs(config.proxy.timeout_secs),
    ));
    let notices = Arc::new(NoticeBoard::new(
        Duration::from_secs(config.notices.debounce_secs),
        clock,
    ));
    let upstream_base = config.upstream_base().to_string();

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        usage.clone(),
        transport.clone(),
        notices,
        upstream_base.clone(),
    ));

    let refresh_task = config
        .pool
        .background_refresh()
        .map(|interval| account_pool::spawn_refresh_task(store.clone(), interval));

    let app_state = AppState {
        orchestrator,
        store: store.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    let admin_listener = match config.proxy.admin_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {addr}"))?;
            info!(addr = %addr, "admin API listening");
            Some(listener)
        }
        None => None,
    };

    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown: the signal tells both servers to stop accepting and
    // drain; DRAIN_TIMEOUT starts at signal receipt.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut proxy_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = proxy_rx.changed().await;
            })
            .await
    });

    let admin_handle = admin_listener.map(|listener| {
        let admin_app = build_admin_router(AdminState::new(
            store.clone(),
            usage.clone(),
            transport.clone(),
            upstream_base.clone(),
            foreign.clone(),
        ));
        let mut admin_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(listener, admin_app)
                .with_graceful_shutdown(async move {
                    let _ = admin_rx.changed().await;
                })
                .await
        })
    });

    // Wait for the OS signal
    shutdown_signal().await;

    // Signal the servers to begin draining
    let _ = shutdown_tx.send(true);

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
    if let Some(handle) = admin_handle
        && tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err()
    {
        warn!("admin listener did not stop in time");
    }
    if let Some(task) = refresh_task {
        task.abort();
    }

    // Final flush of both stores
    common::best_effort("save account pool", store.save()).await;
    common::best_effort("save usage snapshots", usage.save()).await;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool readiness as `healthy`, `degraded` or `unhealthy`.
/// Returns 503 only when no account is ready.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.store.summary().await;
    let health = summary.health();
    let status_code = if health == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": health,
        "accounts": summary,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: text exposition format.
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

/// Catch-all handler that sends every other request through the pool.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.orchestrator, request, request_id).await
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
