//! HTTP endpoint exposing full-sync progress and limiter tuning.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::qos::{Qos, QosStats};

/// Shared state behind the endpoint.
#[derive(Clone)]
pub struct MonitorState {
    /// Run progress.
    pub progress: Arc<ProgressTracker>,
    /// Global limiter.
    pub qos: Arc<Qos>,
}

/// Body of `GET /progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    /// Run progress.
    pub progress: ProgressSnapshot,
    /// Limiter state.
    pub qos: QosStats,
}

/// Body of `PUT /qos`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosUpdate {
    /// New documents-per-second ceiling (0 = unlimited).
    pub limit: u64,
}

/// Routes of the monitoring endpoint.
pub fn router(state: MonitorState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/progress", get(progress_handler))
        .route("/qos", put(qos_handler))
        .with_state(state)
}

/// Bind `addr` and serve until `cancel` fires. Returns the bound address and
/// the server task.
pub async fn spawn(
    addr: SocketAddr,
    state: MonitorState,
    cancel: CancellationToken,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!("Full sync monitor listening on {}", local);

    let app = router(state);
    let handle = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("Full sync monitor error: {}", e);
        }
    });
    Ok((local, handle))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn progress_handler(State(state): State<MonitorState>) -> Json<ProgressResponse> {
    Json(ProgressResponse {
        progress: state.progress.snapshot(),
        qos: state.qos.stats(),
    })
}

async fn qos_handler(
    State(state): State<MonitorState>,
    Json(update): Json<QosUpdate>,
) -> (StatusCode, Json<QosStats>) {
    state.qos.set_limit(update.limit);
    (StatusCode::OK, Json(state.qos.stats()))
}
