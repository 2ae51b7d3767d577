//! Server assembly: wiring, HTTP router, graceful shutdown.
//!
//! Everything the handlers need hangs off one [`ServerContext`];
//! construction order is storage → bus → stores → coordinator → router,
//! with the reaper spawned on the root cancellation token. The binary
//! and the integration tests both go through [`SyncServer::build`] so
//! they exercise the same wiring.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::AuthGate;
use crate::awareness::AwarenessStore;
use crate::config::Config;
use crate::document::DocumentStore;
use crate::health::{health_handler, ready_handler};
use crate::jobs::run_awareness_reaper;
use crate::metrics::metrics_handler;
use crate::pubsub::PubSub;
use crate::realtime::websocket::ws_handler;
use crate::realtime::MessageRouter;
use crate::realtime::ConnectionRegistry;
use crate::storage::Storage;
use crate::sync::SyncCoordinator;

pub struct ServerContext {
    pub config: Config,
    pub auth_gate: Arc<AuthGate>,
    pub router: Arc<MessageRouter>,
    pub coordinator: Arc<SyncCoordinator>,
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<dyn PubSub>,
    pub shutdown: CancellationToken,
    pub accept_semaphore: Option<Arc<Semaphore>>,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Cloneable axum state wrapping the shared context.
#[derive(Clone)]
pub struct AppState(Arc<ServerContext>);

impl AppState {
    pub fn context(&self) -> Arc<ServerContext> {
        self.0.clone()
    }
}

pub struct SyncServer {
    context: Arc<ServerContext>,
}

impl SyncServer {
    /// Wire every component together and start the background jobs.
    pub fn build(
        config: Config,
        storage: Arc<dyn Storage>,
        bus: Arc<dyn PubSub>,
        shutdown: CancellationToken,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let documents = Arc::new(DocumentStore::new(storage.clone(), config.delta_log_limit));
        let awareness = Arc::new(AwarenessStore::new(config.awareness_ttl_ms()));
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let coordinator = SyncCoordinator::new(
            &config,
            documents,
            awareness,
            registry,
            storage.clone(),
            bus.clone(),
            shutdown.clone(),
        );
        let auth_gate = Arc::new(AuthGate::new(&config));
        let router = Arc::new(MessageRouter::new(auth_gate.clone(), coordinator.clone()));

        let accept_semaphore = if config.accept_concurrency > 0 {
            Some(Arc::new(Semaphore::new(config.accept_concurrency)))
        } else {
            None
        };

        tokio::spawn(run_awareness_reaper(
            coordinator.clone(),
            config.awareness_reaper_interval,
            shutdown.clone(),
        ));

        let context = Arc::new(ServerContext {
            config,
            auth_gate,
            router,
            coordinator,
            storage,
            bus,
            shutdown,
            accept_semaphore,
            metrics_handle,
        });
        Self { context }
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    /// The HTTP surface: the wire endpoint plus health and metrics.
    pub fn app(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState(self.context.clone()))
    }

    /// Serve until the shutdown token fires.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let shutdown = self.context.shutdown.clone();
        info!(addr = %listener.local_addr()?, "listening");
        axum::serve(listener, self.app())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    /// Graceful drain: stop accepting, close every connection going
    /// away, wait a bounded grace for queues to flush, then cancel all
    /// timers and release the collaborators.
    pub async fn shutdown(&self) {
        info!("shutdown requested");
        let registry = self.context.coordinator.registry();
        registry.close_all("server shutting down");

        let deadline = tokio::time::Instant::now() + self.context.config.shutdown_grace;
        while !registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        self.context.shutdown.cancel();
        self.context.bus.disconnect().await;
        if let Err(e) = self.context.storage.disconnect().await {
            tracing::warn!(error = %e, "storage disconnect failed");
        }
        info!("shutdown complete");
    }
}
