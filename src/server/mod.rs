//! HTTP API
//!
//! Producers post observations here; schedulers and dashboards trigger
//! cycles and read history. No authentication.

pub mod http;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordinator::Coordinator;
use crate::scheduler::SchedulerState;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub coordinator: Arc<Coordinator>,
    /// Present when a scheduler runs alongside the server
    pub scheduler: Option<Arc<RwLock<SchedulerState>>>,
}

/// Build the API router
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/observations",
            post(http::record_observation_handler).delete(http::purge_observations_handler),
        )
        .route("/api/observations/{metric}", get(http::query_observations_handler))
        .route("/api/cycles", post(http::run_cycle_handler))
        .route("/api/history", get(http::history_handler))
        .route("/api/dimensions", get(http::dimensions_handler))
        .route("/api/triggers", get(http::triggers_handler))
        .route("/api/status", get(http::status_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the shutdown signal fires
pub async fn start(
    state: ServerState,
    host: &str,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("API listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("API shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
