//! Prometheus metrics recorder.
//!
//! Components record through the `metrics` facade; this module owns
//! the exporter and the series descriptions, and serves `GET /metrics`.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// Install the global recorder. Call once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_gauge!(
            "sync_connections_active",
            "Currently registered WebSocket connections"
        );
        metrics::describe_counter!(
            "sync_connections_rejected_total",
            "Connections rejected by the global cap"
        );
        metrics::describe_counter!(
            "sync_messages_sent_total",
            "Outbound wire messages enqueued"
        );
        metrics::describe_counter!(
            "sync_deltas_applied_total",
            "Field-level LWW applications"
        );
        metrics::describe_counter!(
            "sync_ack_timeouts_total",
            "Fan-out deliveries abandoned after exhausting ack retries"
        );
        metrics::describe_counter!(
            "sync_pubsub_reconnects_total",
            "Pub/sub transport reconnections"
        );
        metrics::describe_counter!(
            "sync_awareness_expired_total",
            "Awareness entries removed by the reaper"
        );

        Self { handle }
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }
}

/// `GET /metrics`
pub async fn metrics_handler(
    state: axum::extract::State<crate::server::AppState>,
) -> impl IntoResponse {
    match &state.context().metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
