//! Periodic awareness expiration.
//!
//! Every tick: list the expired entries, broadcast a null-state
//! `awareness_update` (clock bumped past the expired one) to the local
//! subscribers of each affected document, then prune. The broadcast is
//! local only — peer instances run their own reapers over their own
//! stores. Errors are logged and the loop keeps going; the task stops
//! with the server's root cancellation token.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sync::SyncCoordinator;

pub async fn run_awareness_reaper(
    coordinator: Arc<SyncCoordinator>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick is a no-op

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("awareness reaper stopping");
                return;
            }
            _ = ticker.tick() => {
                reap_once(&coordinator);
            }
        }
    }
}

/// One reaper cycle: broadcast leaves, then prune. Separated out so
/// tests can drive it without waiting for the interval.
pub fn reap_once(coordinator: &Arc<SyncCoordinator>) {
    let awareness = coordinator.awareness();
    let expired = awareness.list_expired();
    if expired.is_empty() {
        return;
    }

    debug!(count = expired.len(), "reaping expired awareness entries");
    for entry in &expired {
        coordinator.broadcast_awareness_leave(
            &entry.document_id,
            &entry.client_id,
            entry.clock,
            None,
        );
    }

    let pruned = awareness.prune_expired();
    metrics::counter!("sync_awareness_expired_total", pruned.len() as u64);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::auth::TokenPayload;
    use crate::awareness::AwarenessStore;
    use crate::config::Config;
    use crate::document::DocumentStore;
    use crate::protocol::codec::ProtocolType;
    use crate::protocol::{Message, MessageBody};
    use crate::pubsub::{LocalBus, PubSub};
    use crate::realtime::connection::{Connection, OutboundFrame};
    use crate::realtime::registry::ConnectionRegistry;
    use crate::storage::{InMemoryStorage, Storage};

    fn coordinator_with_ttl(ttl_ms: i64) -> Arc<SyncCoordinator> {
        let config = Config::default();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let documents = Arc::new(DocumentStore::new(storage.clone(), 1000));
        let awareness = Arc::new(AwarenessStore::new(ttl_ms));
        let registry = Arc::new(ConnectionRegistry::new(100));
        let bus: Arc<dyn PubSub> = Arc::new(LocalBus::standalone("synckit:"));
        SyncCoordinator::new(
            &config,
            documents,
            awareness,
            registry,
            storage,
            bus,
            CancellationToken::new(),
        )
    }

    fn watcher(
        coordinator: &Arc<SyncCoordinator>,
        id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) = Connection::new(id.to_string(), 64, CancellationToken::new());
        conn.pin_protocol(ProtocolType::Text);
        conn.authenticate(TokenPayload::admin("watcher"), None);
        coordinator.registry().register(conn.clone()).unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                messages.push(crate::protocol::codec::decode_text(&text).unwrap());
            }
        }
        messages
    }

    #[tokio::test]
    async fn expired_entries_produce_leave_and_vanish() {
        // A 1 ms TTL expires entries essentially immediately.
        let coordinator = coordinator_with_ttl(1);
        let (_conn, mut rx) = watcher(&coordinator, "c-watch");
        coordinator.awareness().add_subscriber("doc-1", "c-watch");

        coordinator
            .awareness()
            .set("doc-1", "A", Some(json!({"cursor": 1})), 3);
        tokio::time::sleep(Duration::from_millis(10)).await;

        reap_once(&coordinator);

        assert!(coordinator.awareness().list_active("doc-1").is_empty());
        assert!(coordinator.awareness().get("doc-1", "A").is_none());

        let leaves: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m.body {
                MessageBody::AwarenessUpdate(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].state, None);
        assert_eq!(leaves[0].clock, 4);
        assert_eq!(leaves[0].client_id.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn live_entries_survive_the_cycle() {
        let coordinator = coordinator_with_ttl(60_000);
        coordinator.awareness().set("doc-1", "A", Some(json!(1)), 1);

        reap_once(&coordinator);

        assert_eq!(coordinator.awareness().list_active("doc-1").len(), 1);
    }

    #[tokio::test]
    async fn reaper_task_cooperates_with_shutdown() {
        let coordinator = coordinator_with_ttl(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_awareness_reaper(
            coordinator,
            Duration::from_millis(5),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper exits on cancel")
            .unwrap();
    }
}
