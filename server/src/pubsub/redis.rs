//! Redis pub/sub backend.
//!
//! Publishing goes through a `ConnectionManager`, which re-establishes
//! its connection on its own. Subscriptions live on a dedicated task
//! owning one pub/sub connection: when that connection drops, the task
//! reconnects with capped exponential backoff and re-subscribes every
//! channel still referenced locally, so a broker restart never leaves
//! a document silently unsubscribed. Each reconnect bumps an exposed
//! counter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    awareness_channel, delta_channel, parse_channel, BusEvent, BusHandler, PubSub,
    PUBLISHED_ID_TTL,
};
use crate::error::SyncError;
use crate::protocol::{codec, DocumentId, Message};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

enum SubCommand {
    Subscribe(DocumentId),
    Unsubscribe(DocumentId),
}

pub struct RedisBus {
    manager: ConnectionManager,
    prefix: String,
    published: moka::sync::Cache<String, ()>,
    refcounts: DashMap<DocumentId, usize>,
    handler: Arc<once_cell::sync::OnceCell<BusHandler>>,
    commands: mpsc::UnboundedSender<SubCommand>,
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl RedisBus {
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<Self, SyncError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| SyncError::PubSub(format!("invalid redis url: {e}")))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| SyncError::PubSub(format!("redis connect failed: {e}")))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(once_cell::sync::OnceCell::new());
        let connected = Arc::new(AtomicBool::new(true));
        let reconnects = Arc::new(AtomicU64::new(0));

        let bus = Self {
            manager,
            prefix: prefix.to_string(),
            published: moka::sync::Cache::builder()
                .time_to_live(PUBLISHED_ID_TTL)
                .build(),
            refcounts: DashMap::new(),
            handler: handler.clone(),
            commands,
            connected: connected.clone(),
            reconnects: reconnects.clone(),
            cancel: cancel.clone(),
        };

        tokio::spawn(subscriber_task(SubscriberTaskContext {
            client,
            prefix: bus.prefix.clone(),
            published: bus.published.clone(),
            handler,
            command_rx,
            connected,
            reconnects,
            cancel,
        }));

        info!("redis bus connected");
        Ok(bus)
    }

    async fn publish(&self, channel: &str, message: &Message) -> Result<(), SyncError> {
        let payload = codec::encode_text(message)?;
        // Record before publishing so the echo can never outrun the
        // suppression entry.
        self.published.insert(message.id.clone(), ());

        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| SyncError::PubSub(format!("publish on {channel} failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisBus {
    async fn publish_delta(&self, document_id: &str, message: &Message) -> Result<(), SyncError> {
        self.publish(&delta_channel(&self.prefix, document_id), message)
            .await
    }

    async fn publish_awareness(
        &self,
        document_id: &str,
        message: &Message,
    ) -> Result<(), SyncError> {
        self.publish(&awareness_channel(&self.prefix, document_id), message)
            .await
    }

    async fn subscribe(&self, document_id: &str, handler: BusHandler) -> Result<(), SyncError> {
        let _ = self.handler.set(handler);

        let mut refcount = self.refcounts.entry(document_id.to_string()).or_insert(0);
        *refcount += 1;
        if *refcount == 1 {
            self.commands
                .send(SubCommand::Subscribe(document_id.to_string()))
                .map_err(|_| SyncError::PubSub("subscriber task gone".to_string()))?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, document_id: &str) -> Result<(), SyncError> {
        let drop_channels = match self.refcounts.get_mut(document_id) {
            Some(mut refcount) => {
                *refcount = refcount.saturating_sub(1);
                *refcount == 0
            }
            None => false,
        };
        if drop_channels {
            self.refcounts.remove(document_id);
            self.commands
                .send(SubCommand::Unsubscribe(document_id.to_string()))
                .map_err(|_| SyncError::PubSub("subscriber task gone".to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::Relaxed);
    }

    fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Subscriber task
// ---------------------------------------------------------------------------

struct SubscriberTaskContext {
    client: redis::Client,
    prefix: String,
    published: moka::sync::Cache<String, ()>,
    handler: Arc<once_cell::sync::OnceCell<BusHandler>>,
    command_rx: mpsc::UnboundedReceiver<SubCommand>,
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU64>,
    cancel: CancellationToken,
}

enum TaskStep {
    Shutdown,
    Command(Option<SubCommand>),
    Received(Option<redis::Msg>),
}

async fn subscriber_task(mut ctx: SubscriberTaskContext) {
    // Documents whose channels must survive a reconnect.
    let mut referenced: HashSet<DocumentId> = HashSet::new();
    let mut backoff = RECONNECT_BASE;
    let mut first_attempt = true;

    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        if !first_attempt {
            ctx.connected.store(false, Ordering::Relaxed);
            ctx.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("sync_pubsub_reconnects_total", 1);
            warn!(
                backoff_secs = backoff.as_secs(),
                "redis subscriber reconnecting after backoff"
            );
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = ctx.cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
        first_attempt = false;

        let mut pubsub = match ctx.client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!(error = %e, "redis pubsub connection failed");
                continue;
            }
        };

        // Re-subscribe everything still referenced.
        let mut resubscribe_failed = false;
        for document_id in &referenced {
            if subscribe_both(&mut pubsub, &ctx.prefix, document_id)
                .await
                .is_err()
            {
                resubscribe_failed = true;
                break;
            }
        }
        if resubscribe_failed {
            continue;
        }

        ctx.connected.store(true, Ordering::Relaxed);
        backoff = RECONNECT_BASE;
        debug!(channels = referenced.len(), "redis subscriber (re)connected");

        loop {
            let step = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    _ = ctx.cancel.cancelled() => TaskStep::Shutdown,
                    command = ctx.command_rx.recv() => TaskStep::Command(command),
                    received = stream.next() => TaskStep::Received(received),
                }
            };

            match step {
                TaskStep::Shutdown => return,
                TaskStep::Command(None) => return,
                TaskStep::Command(Some(SubCommand::Subscribe(document_id))) => {
                    referenced.insert(document_id.clone());
                    if subscribe_both(&mut pubsub, &ctx.prefix, &document_id)
                        .await
                        .is_err()
                    {
                        break; // reconnect loop re-subscribes everything
                    }
                }
                TaskStep::Command(Some(SubCommand::Unsubscribe(document_id))) => {
                    referenced.remove(&document_id);
                    if unsubscribe_both(&mut pubsub, &ctx.prefix, &document_id)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                TaskStep::Received(Some(received)) => {
                    dispatch(&ctx.prefix, &received, &ctx.published, &ctx.handler);
                }
                TaskStep::Received(None) => {
                    warn!("redis pubsub stream ended");
                    break;
                }
            }
        }
    }
}

async fn subscribe_both(
    pubsub: &mut redis::aio::PubSub,
    prefix: &str,
    document_id: &str,
) -> Result<(), redis::RedisError> {
    pubsub.subscribe(delta_channel(prefix, document_id)).await?;
    pubsub
        .subscribe(awareness_channel(prefix, document_id))
        .await
}

async fn unsubscribe_both(
    pubsub: &mut redis::aio::PubSub,
    prefix: &str,
    document_id: &str,
) -> Result<(), redis::RedisError> {
    pubsub
        .unsubscribe(delta_channel(prefix, document_id))
        .await?;
    pubsub
        .unsubscribe(awareness_channel(prefix, document_id))
        .await
}

fn dispatch(
    prefix: &str,
    received: &redis::Msg,
    published: &moka::sync::Cache<String, ()>,
    handler: &once_cell::sync::OnceCell<BusHandler>,
) {
    let channel = received.get_channel_name().to_string();
    let payload: String = match received.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(channel = %channel, error = %e, "non-text bus payload dropped");
            return;
        }
    };

    let message = match codec::decode_text(&payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(channel = %channel, error = %e, "undecodable bus payload dropped");
            return;
        }
    };

    // Loopback suppression: drop our own publications, removing the id.
    if published.get(&message.id).is_some() {
        published.invalidate(&message.id);
        return;
    }

    let Some((kind, document_id)) = parse_channel(prefix, &channel) else {
        warn!(channel = %channel, "bus message on unparseable channel");
        return;
    };

    if let Some(handler) = handler.get() {
        handler(BusEvent {
            kind,
            document_id,
            message,
        });
    }
}
