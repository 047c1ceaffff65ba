//! Read-only HTTP surface and the realtime WebSocket endpoint

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{CollectorError, Result};
use crate::metrics::{CollectorStats, WriteStats};
use crate::model::AlarmRecord;
use crate::publish::realtime::serve_socket;
use crate::publish::{BusStatus, Publisher};
use crate::reader::{LinkRegistry, LinkStatus};
use crate::store::StoreIntrospection;

#[derive(Clone)]
pub struct ApiState {
    pub stats: Arc<WriteStats>,
    pub links: Arc<LinkRegistry>,
    pub store: Arc<dyn StoreIntrospection>,
    pub publisher: Publisher,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub collector: CollectorStats,
    pub endpoints: BTreeMap<String, LinkStatus>,
    pub realtime_connections: usize,
    pub bus: BusStatus,
}

#[derive(Serialize)]
pub struct AlarmListResponse {
    pub alarms: Vec<AlarmRecord>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub timestamp: i64,
}

impl From<CollectorError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: CollectorError) -> Self {
        let (status, code) = match &err {
            CollectorError::StorageError(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        (
            status,
            Json(ErrorResponse {
                error: err.to_string(),
                code: code.to_string(),
                timestamp: chrono::Utc::now().timestamp(),
            }),
        )
    }
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "collsrv".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        collector: state.stats.snapshot(),
        endpoints: state.links.snapshot(),
        realtime_connections: state.publisher.hub().connection_count(),
        bus: state.publisher.bus_status(),
    })
}

pub async fn list_active_alarms(
    State(state): State<ApiState>,
) -> std::result::Result<Json<AlarmListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let alarms = state.store.active_alarms().await?;
    Ok(Json(AlarmListResponse {
        total: alarms.len(),
        alarms,
    }))
}

pub async fn ws_realtime(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    let hub = state.publisher.hub().clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/alarms/active", get(list_active_alarms))
        .route("/ws/realtime", get(ws_realtime))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn serve(addr: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CollectorError::io(format!("Failed to bind {}: {}", addr, e)))?;
    info!("API listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| CollectorError::io(format!("API server failed: {}", e)))?;
    info!("API stopped");
    Ok(())
}
