//! In-process pub/sub backend.
//!
//! A [`LocalBusHub`] holds one broadcast channel per bus channel name;
//! every [`LocalBus`] attached to the same hub behaves like a server
//! instance attached to the same broker. Single-instance deployments
//! run one hub with one bus; the integration tests run one hub with
//! several buses to exercise cross-instance fan-out and loopback
//! suppression without a broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    awareness_channel, delta_channel, parse_channel, BusEvent, BusHandler, PubSub,
    PUBLISHED_ID_TTL,
};
use crate::error::SyncError;
use crate::protocol::{codec, DocumentId, Message};

const CHANNEL_CAPACITY: usize = 1024;

/// The shared "broker": channel name → broadcast sender.
#[derive(Default)]
pub struct LocalBusHub {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl LocalBusHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

struct LocalSubscription {
    refcount: usize,
    cancel: CancellationToken,
}

/// One instance's attachment to the hub.
pub struct LocalBus {
    hub: Arc<LocalBusHub>,
    prefix: String,
    published: moka::sync::Cache<String, ()>,
    subscriptions: DashMap<DocumentId, LocalSubscription>,
    handler: once_cell::sync::OnceCell<BusHandler>,
    cancel: CancellationToken,
    connected: AtomicBool,
}

impl LocalBus {
    pub fn new(hub: Arc<LocalBusHub>, prefix: &str) -> Self {
        Self {
            hub,
            prefix: prefix.to_string(),
            published: moka::sync::Cache::builder()
                .time_to_live(PUBLISHED_ID_TTL)
                .build(),
            subscriptions: DashMap::new(),
            handler: once_cell::sync::OnceCell::new(),
            cancel: CancellationToken::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Hub + bus pair for single-instance runs.
    pub fn standalone(prefix: &str) -> Self {
        Self::new(LocalBusHub::new(), prefix)
    }

    fn publish(&self, channel: &str, message: &Message) -> Result<(), SyncError> {
        let payload = codec::encode_text(message)?;
        self.published.insert(message.id.clone(), ());
        // No receivers is fine: nobody on any instance is subscribed.
        let _ = self.hub.channel(channel).send(payload);
        Ok(())
    }

    fn spawn_receiver(&self, channel: String, cancel: CancellationToken) {
        let mut rx = self.hub.channel(&channel).subscribe();
        let prefix = self.prefix.clone();
        let published = self.published.clone();
        let handler = self.handler.clone();
        let bus_cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = bus_cancel.cancelled() => return,
                    received = rx.recv() => match received {
                        Ok(payload) => {
                            dispatch(&prefix, &channel, &payload, &published, &handler);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "local bus receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }
}

fn dispatch(
    prefix: &str,
    channel: &str,
    payload: &str,
    published: &moka::sync::Cache<String, ()>,
    handler: &once_cell::sync::OnceCell<BusHandler>,
) {
    let message = match codec::decode_text(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(channel = %channel, error = %e, "undecodable bus payload dropped");
            return;
        }
    };

    // Loopback suppression: our own publication comes back from the
    // hub like anyone else's.
    if published.get(&message.id).is_some() {
        published.invalidate(&message.id);
        return;
    }

    let Some((kind, document_id)) = parse_channel(prefix, channel) else {
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

#[async_trait]
impl PubSub for LocalBus {
    async fn publish_delta(&self, document_id: &str, message: &Message) -> Result<(), SyncError> {
        self.publish(&delta_channel(&self.prefix, document_id), message)
    }

    async fn publish_awareness(
        &self,
        document_id: &str,
        message: &Message,
    ) -> Result<(), SyncError> {
        self.publish(&awareness_channel(&self.prefix, document_id), message)
    }

    async fn subscribe(&self, document_id: &str, handler: BusHandler) -> Result<(), SyncError> {
        let _ = self.handler.set(handler);

        let mut entry = self
            .subscriptions
            .entry(document_id.to_string())
            .or_insert_with(|| LocalSubscription {
                refcount: 0,
                cancel: self.cancel.child_token(),
            });
        entry.refcount += 1;
        if entry.refcount == 1 {
            debug!(document = %document_id, "local bus subscribing channels");
            let cancel = entry.cancel.clone();
            self.spawn_receiver(delta_channel(&self.prefix, document_id), cancel.clone());
            self.spawn_receiver(awareness_channel(&self.prefix, document_id), cancel);
        }
        Ok(())
    }

    async fn unsubscribe(&self, document_id: &str) -> Result<(), SyncError> {
        let remove = match self.subscriptions.get_mut(document_id) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if remove {
            if let Some((_, sub)) = self.subscriptions.remove(document_id) {
                sub.cancel.cancel();
                debug!(document = %document_id, "local bus left channels");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.cancel.cancel();
        let docs: Vec<String> = self
            .subscriptions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for doc in docs {
            self.subscriptions.remove(&doc);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::protocol::{MessageBody, PingPayload};
    use crate::pubsub::BusKind;

    fn collector() -> (BusHandler, Arc<Mutex<Vec<BusEvent>>>) {
        let seen: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: BusHandler = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (handler, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn cross_instance_delivery() {
        let hub = LocalBusHub::new();
        let a = LocalBus::new(hub.clone(), "synckit:");
        let b = LocalBus::new(hub, "synckit:");

        let (handler_a, seen_a) = collector();
        let (handler_b, seen_b) = collector();
        a.subscribe("doc-1", handler_a).await.unwrap();
        b.subscribe("doc-1", handler_b).await.unwrap();
        settle().await;

        let message = Message::new(MessageBody::Ping(PingPayload {}));
        a.publish_delta("doc-1", &message).await.unwrap();
        settle().await;

        // B gets it exactly once; A suppressed its own publication.
        let b_events = seen_b.lock().unwrap();
        assert_eq!(b_events.len(), 1);
        assert_eq!(b_events[0].kind, BusKind::Delta);
        assert_eq!(b_events[0].document_id, "doc-1");
        assert_eq!(b_events[0].message, message);
        assert!(seen_a.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn awareness_channel_is_distinct() {
        let hub = LocalBusHub::new();
        let a = LocalBus::new(hub.clone(), "synckit:");
        let b = LocalBus::new(hub, "synckit:");

        let (handler_b, seen_b) = collector();
        b.subscribe("doc-1", handler_b).await.unwrap();
        settle().await;

        a.publish_awareness("doc-1", &Message::new(MessageBody::Ping(PingPayload {})))
            .await
            .unwrap();
        settle().await;

        let events = seen_b.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, BusKind::Awareness);
    }

    #[tokio::test]
    async fn refcounted_unsubscribe() {
        let hub = LocalBusHub::new();
        let a = LocalBus::new(hub.clone(), "synckit:");
        let b = LocalBus::new(hub, "synckit:");

        let (handler, seen) = collector();
        b.subscribe("doc-1", handler.clone()).await.unwrap();
        b.subscribe("doc-1", handler).await.unwrap();
        settle().await;

        // One of two local references gone: still listening.
        b.unsubscribe("doc-1").await.unwrap();
        a.publish_delta("doc-1", &Message::new(MessageBody::Ping(PingPayload {})))
            .await
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        // Last reference gone: channel abandoned.
        b.unsubscribe("doc-1").await.unwrap();
        settle().await;
        a.publish_delta("doc-1", &Message::new(MessageBody::Ping(PingPayload {})))
            .await
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_documents_are_silent() {
        let hub = LocalBusHub::new();
        let a = LocalBus::new(hub.clone(), "synckit:");
        let b = LocalBus::new(hub, "synckit:");

        let (handler, seen) = collector();
        b.subscribe("doc-1", handler).await.unwrap();
        settle().await;

        a.publish_delta("doc-2", &Message::new(MessageBody::Ping(PingPayload {})))
            .await
            .unwrap();
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_stops_delivery() {
        let hub = LocalBusHub::new();
        let a = LocalBus::new(hub.clone(), "synckit:");
        let b = LocalBus::new(hub, "synckit:");

        let (handler, seen) = collector();
        b.subscribe("doc-1", handler).await.unwrap();
        settle().await;

        b.disconnect().await;
        assert!(!b.is_connected());
        settle().await;

        a.publish_delta("doc-1", &Message::new(MessageBody::Ping(PingPayload {})))
            .await
            .unwrap();
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
