//! Compliance Session Gateway
//!
//! Single-binary Rust service that:
//! 1. Holds the compliance API session (login, persisted tokens, logout)
//! 2. Listens for local requests
//! 3. Forwards them to the compliance API with the stored bearer token
//! 4. Renews the access token transparently on 401 and replays once

mod config;
mod error;
mod metrics;
mod proxy;
mod service;
mod session;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{FromRef, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::CredentialStore;
use session_pipeline::SessionManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics, new_request_id};

/// Grace period for cancelled requests to answer after the drain deadline.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
}

impl FromRef<AppState> for Arc<SessionManager> {
    fn from_ref(state: &AppState) -> Self {
        state.proxy.manager.clone()
    }
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", get(session::status))
        .route("/session/login", post(session::login))
        .route("/session/logout", post(session::logout))
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

    info!("starting compliance-session-gateway");

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
        listen_addr = %config.gateway.listen_addr,
        api_base_url = %config.api.base_url,
        session_file = %config.session.file.display(),
        "configuration loaded"
    );

    let store = CredentialStore::load(
        config.session.file.clone(),
        config.session.legacy_keys.as_slice(),
    )
    .await
    .with_context(|| {
        format!(
            "failed to load session from {}",
            config.session.file.display()
        )
    })?;

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let manager = Arc::new(SessionManager::new(
        config.pipeline_config(),
        Arc::new(store),
        client,
    ));

    let service_metrics = ServiceMetrics::new();
    let cancel = CancellationToken::new();

    let app_state = AppState {
        proxy: ProxyState {
            manager: manager.clone(),
            metrics: service_metrics.clone(),
            shutdown: cancel.clone(),
        },
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, session_state = manager.state().await.label(), "accepting requests");

    // Graceful shutdown: stop accepting on signal, give in-flight requests
    // DRAIN_TIMEOUT, then cancel whatever is still waiting upstream.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut server_handle).await {
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
            let remaining = service_metrics.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, cancelling remaining requests"
            );
            cancel.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut server_handle)
                .await
                .is_err()
            {
                server_handle.abort();
            }
        }
    }

    if let Err(e) = manager.teardown().await {
        warn!(error = %e, "session teardown failed");
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: liveness plus session state and request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.proxy.metrics;
    let manager = &state.proxy.manager;
    let body = serde_json::json!({
        "status": "healthy",
        "logged_in": manager.store().is_logged_in().await,
        "session_state": manager.state().await.label(),
        "uptime_seconds": metrics.started_at.elapsed().as_secs(),
        "requests_served": metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": metrics.errors_total.load(Ordering::Relaxed),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
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

/// Catch-all handler that forwards everything else to the compliance API.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::proxy_request(&state.proxy, request, new_request_id()).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
