//! Liveness and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::server::AppState;
use crate::util::now_ms;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    version: &'static str,
    connections: usize,
    documents: usize,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    pubsub_connected: bool,
    pubsub_reconnects: u64,
}

/// `GET /health` — process liveness plus a small state summary.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let context = state.context();
    Json(HealthResponse {
        status: "ok",
        timestamp: now_ms(),
        version: env!("CARGO_PKG_VERSION"),
        connections: context.coordinator.registry().len(),
        documents: context.coordinator.documents().len(),
    })
}

/// `GET /ready` — readiness reflects the pub/sub fabric: an instance
/// without its bus would serve stale fan-out in a fleet.
pub async fn ready_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let context = state.context();
    let connected = context.bus.is_connected();
    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: connected,
            pubsub_connected: connected,
            pubsub_reconnects: context.bus.reconnect_count(),
        }),
    )
}
