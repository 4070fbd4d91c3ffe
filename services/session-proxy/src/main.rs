//! Session Proxy
//!
//! Single-binary Rust service that:
//! 1. Holds one session credential (login, restore from disk, logout)
//! 2. Proxies requests to an upstream API with the credential attached
//! 3. Refreshes the credential once for all concurrent requests when it
//!    expires or upstream rejects it
//! 4. Reports session state on /health, /session and /metrics

mod config;
mod metrics;
mod proxy;
mod session_api;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use credential::{FileKv, HttpTokenIssuer, KeyValueStore, MemoryKv, TokenIssuer, TokenStore};
use gateway::{GatewayConfig, RequestGateway};
use metrics_exporter_prometheus::PrometheusHandle;
use session::{Access, AccessGuard, RefreshCoordinator, SessionControl, SessionState};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::session_api::{SessionApiState, build_session_router};

/// How long in-flight requests may drain after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    guard: AccessGuard,
    session_api: SessionApiState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit covers the session routes as well as the proxy.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let session_routes = build_session_router(state.session_api.clone());
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .merge(session_routes)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
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

    info!("starting session-proxy");

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
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        token_url = %config.issuer.token_url,
        persistent = config.session.credential_file.is_some(),
        "configuration loaded"
    );

    let client = reqwest::Client::new();

    let backend: Arc<dyn KeyValueStore> = match &config.session.credential_file {
        Some(path) => {
            let kv = FileKv::load(path.clone()).await.with_context(|| {
                format!("failed to open credential file {}", path.display())
            })?;
            info!(path = %kv.path().display(), "credential file opened");
            Arc::new(kv)
        }
        None => Arc::new(MemoryKv::new()),
    };
    let store = Arc::new(TokenStore::new(backend));
    let state = SessionState::new();
    let observer = metrics::spawn_session_observer(state.subscribe());
    let control = Arc::new(SessionControl::new(store, state.clone()));

    let restored = control
        .restore(config.session.subject.clone())
        .await
        .context("failed to restore session")?;
    info!(state = restored.label(), "session restored from storage");

    let issuer: Arc<dyn TokenIssuer> = Arc::new(HttpTokenIssuer::new(
        client.clone(),
        config.issuer.token_url.clone(),
        config.issuer.client_id.clone(),
        config.issuer.client_secret.clone(),
    ));
    let coordinator = RefreshCoordinator::with_timeout(
        control.clone(),
        issuer.clone(),
        Duration::from_secs(config.issuer.timeout_secs),
    );

    let refresh_handle = session::spawn_refresh_task(
        coordinator.clone(),
        config.session.refresh_interval(),
        config.session.refresh_threshold(),
    );

    let gateway = RequestGateway::new(
        coordinator,
        GatewayConfig {
            refresh_before_expiry: true,
            expiry_leeway: config.session.expiry_leeway(),
        },
    );

    let app_state = AppState {
        proxy: ProxyState {
            client,
            upstream_url: config.proxy.upstream_url.clone(),
            timeout: Duration::from_secs(config.proxy.timeout_secs),
            gateway,
        },
        guard: AccessGuard::new(state),
        session_api: SessionApiState::new(control, issuer),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT, counted from the signal, bounds the drain
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

    refresh_handle.abort();
    observer.abort();
    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: session access decision, refresh status and uptime.
/// Returns 200 when the session allows access, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let coordinator = state.proxy.gateway.coordinator();

    let mut body = serde_json::json!({
        "refresh_in_flight": !coordinator.is_idle(),
        "refresh_in_flight_secs": coordinator.in_flight_for().map(|d| d.as_secs()),
        "refresh_waiters": coordinator.pending_waiters(),
        "uptime_seconds": uptime,
    });

    let status_code = match state.guard.check() {
        Access::Allow => {
            body["status"] = "healthy".into();
            body["session"] = "authenticated".into();
            axum::http::StatusCode::OK
        }
        Access::Deny(reason) => {
            body["status"] = "degraded".into();
            body["session"] = reason.label().into();
            if let session::DenyReason::RefreshFailed(detail) = reason {
                body["reason"] = detail.into();
            }
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        }
    };

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

/// Catch-all handler that proxies everything else to upstream.
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
