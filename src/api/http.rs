//! HTTP API Server
//!
//! Management API: status, pool and cluster inspection, configuration
//! reload and backend health checks. Only hosts listed in
//! `global.auth_ips` may call it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::backend::{Connector, PoolStats};
use crate::error::{Error, Result};
use crate::proxy::ProxyServer;
use crate::reload::ConfigStore;
use crate::router::{ClusterRouter, ClusterStats};

/// Shared application state
pub struct AppState<C: Connector> {
    pub store: Arc<ConfigStore>,
    pub router: Arc<ClusterRouter<C>>,
    pub proxy: Arc<ProxyServer<C>>,
    pub started_at: DateTime<Utc>,
}

/// HTTP API server
pub struct HttpServer<C: Connector> {
    state: Arc<AppState<C>>,
}

impl<C: Connector> HttpServer<C> {
    pub fn new(store: Arc<ConfigStore>, router: Arc<ClusterRouter<C>>, proxy: Arc<ProxyServer<C>>) -> Self {
        let state = Arc::new(AppState {
            store,
            router,
            proxy,
            started_at: Utc::now(),
        });
        Self { state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState<C>> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(state: Arc<AppState<C>>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status::<C>))
            .route("/pools", get(handle_pools::<C>))
            .route("/clusters", get(handle_clusters::<C>))
            .route("/admin/reload", post(handle_reload::<C>))
            .route("/admin/ping", post(handle_ping::<C>))
            .layer(middleware::from_fn_with_state(Arc::clone(&state), check_client_ip::<C>))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind `address` and serve until `shutdown` flips to true
    pub async fn start(&self, address: &str, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!("HTTP API listening on {}", address);
        self.serve(listener, shutdown).await
    }

    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub config_path: Option<String>,
    pub config_generation: u64,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub pools: usize,
    pub writes_routed: u64,
    pub reads_routed: u64,
}

/// Reload response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub success: bool,
    pub generation: u64,
    pub message: Option<String>,
}

/// Result of pinging one pool
#[derive(Debug, Serialize, Deserialize)]
pub struct PingResult {
    pub node: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Middleware ============

async fn check_client_ip<C: Connector>(
    State(state): State<Arc<AppState<C>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = {
        let snapshot = state.store.snapshot().await;
        let ip = peer.ip().to_string();
        snapshot.global.auth_ips.is_empty() || snapshot.global.auth_ips.iter().any(|a| a == &ip)
    };

    if !allowed {
        tracing::warn!(client = %peer, path = %request.uri().path(), "Management request from unauthorized host");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: format!("host {} is not allowed", peer.ip()),
                code: "FORBIDDEN".to_string(),
            }),
        )
            .into_response();
    }
    next.run(request).await
}

// ============ Handlers ============

async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_status<C: Connector>(State(state): State<Arc<AppState<C>>>) -> impl IntoResponse {
    let stats = state.router.stats().await;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at,
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        config_path: state.store.path().map(|p| p.display().to_string()),
        config_generation: state.store.generation(),
        active_sessions: state.proxy.active_sessions(),
        max_sessions: state.proxy.max_sessions(),
        pools: stats.pools,
        writes_routed: stats.writes_routed,
        reads_routed: stats.reads_routed,
    })
}

async fn handle_pools<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<Vec<PoolStats>> {
    Json(state.router.pool_stats().await)
}

async fn handle_clusters<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<Vec<ClusterStats>> {
    Json(state.router.cluster_stats().await)
}

async fn handle_reload<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Response {
    match state.store.force_reload().await {
        Ok(()) => {
            tracing::info!(generation = state.store.generation(), "Configuration reloaded via API");
            Json(ReloadResponse {
                success: true,
                generation: state.store.generation(),
                message: None,
            })
            .into_response()
        }
        Err(e) => {
            tracing::warn!("Configuration reload via API rejected: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(ReloadResponse {
                    success: false,
                    generation: state.store.generation(),
                    message: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn handle_ping<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<Vec<PingResult>> {
    let results = state
        .router
        .ping_all()
        .await
        .into_iter()
        .map(|(node, error)| PingResult {
            node,
            ok: error.is_none(),
            error,
        })
        .collect();
    Json(results)
}
