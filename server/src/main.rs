use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synckit_server::metrics::MetricsRecorder;
use synckit_server::pubsub::{LocalBus, PubSub, RedisBus};
use synckit_server::storage::{InMemoryStorage, PostgresStorage, Storage};
use synckit_server::{Config, SyncServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        bind = %config.bind_addr,
        auth_required = config.auth_required,
        max_connections = config.max_connections,
        batch_window_ms = config.batch_window.as_millis() as u64,
        "starting synckit server"
    );

    let metrics_recorder = MetricsRecorder::install();
    let shutdown = CancellationToken::new();

    // Storage collaborator: PostgreSQL when configured, otherwise the
    // process-local store. The server is memory-authoritative either way.
    let storage: Arc<dyn Storage> = match &config.database_url {
        Some(url) => match PostgresStorage::connect(url).await {
            Ok(postgres) => Arc::new(postgres),
            Err(e) => {
                tracing::warn!(error = %e, "postgres unavailable, falling back to memory storage");
                Arc::new(InMemoryStorage::new())
            }
        },
        None => Arc::new(InMemoryStorage::new()),
    };
    tracing::info!(backend = storage.backend_name(), "storage initialized");

    // Pub/sub fabric: Redis for multi-instance fleets, the in-process
    // bus for a single instance.
    let bus: Arc<dyn PubSub> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBus::connect(url, &config.redis_channel_prefix, shutdown.child_token()).await?,
        ),
        None => {
            tracing::info!("no redis url configured, running single-instance bus");
            Arc::new(LocalBus::standalone(&config.redis_channel_prefix))
        }
    };

    let bind_addr = config.bind_addr;
    let server = Arc::new(SyncServer::build(
        config,
        storage,
        bus,
        shutdown.clone(),
        Some(metrics_recorder.handle()),
    ));

    let listener = TcpListener::bind(bind_addr).await?;

    // Signal handling drives the graceful drain; serve() returns once
    // the root token is cancelled.
    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("interrupt received");
        signal_server.shutdown().await;
    });

    server.serve(listener).await?;
    tracing::info!("server stopped");
    Ok(())
}
