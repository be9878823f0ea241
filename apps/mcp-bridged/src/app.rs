//! HTTP surface and shared application state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::extract::{ConnectInfo, Path as AxumPath, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{ServerCatalog, Settings};
use crate::dispatch;
use crate::jobs::JobWorkspaces;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub catalog: Arc<ServerCatalog>,
    pub jobs: Arc<JobWorkspaces>,
    pub registry: Arc<SessionRegistry>,
    /// Global cap on in-flight subprocess calls.
    pub call_permits: Arc<Semaphore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings, catalog: ServerCatalog) -> anyhow::Result<Self> {
        let jobs = Arc::new(JobWorkspaces::new(settings.jobs_dir.clone())?);
        let registry = Arc::new(SessionRegistry::new(settings.stateful_max_total));
        let call_permits = Arc::new(Semaphore::new(settings.max_concurrent));
        Ok(Self {
            settings: Arc::new(settings),
            catalog: Arc::new(catalog),
            jobs,
            registry,
            call_permits,
            started_at: Instant::now(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/mcp/{server}", post(mcp_endpoint))
        .route("/mcpo/{server}", post(mcpo_endpoint))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve_tcp(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind tcp {addr}"))?;
    info!(addr = %listener.local_addr()?, "mcp-bridged listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve tcp")?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutdown signal received");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "mcp-bridged",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    uptime_seconds: u64,
    version: &'static str,
    stateful_processes: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let live = state.registry.live_sessions();
    // Degrade once the session pool is nearly full so the balancer can back
    // off before acquire starts returning 503s.
    let status = if live * 10 >= state.registry.max_total() * 9 {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        timestamp: Utc::now(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        stateful_processes: live,
    })
}

async fn mcp_endpoint(
    State(state): State<AppState>,
    AxumPath(server): AxumPath<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    dispatch::dispatch(&state, "mcp", &server, &headers, Some(peer.ip()), &body).await
}

async fn mcpo_endpoint(
    State(state): State<AppState>,
    AxumPath(server): AxumPath<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    dispatch::dispatch(&state, "mcpo", &server, &headers, Some(peer.ip()), &body).await
}
