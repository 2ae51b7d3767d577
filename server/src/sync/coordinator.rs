//! Delta orchestration: LWW application, batched fan-out, ACK tracking.
//!
//! A delta is applied to the document store immediately and the sender
//! is ACKed right away — a hop-by-hop "the server accepted your write",
//! independent of fan-out. Broadcast is *not* immediate: accepted
//! writes land in a per-document pending batch flushed after the batch
//! window, with later writes to the same field overwriting earlier
//! ones. The flush sends one message per field to every local
//! subscriber except that field's writer, opens a pending-ACK slot per
//! delivery, and makes a single coalesced publish to the pub/sub bus.
//!
//! Incoming bus traffic is applied locally (LWW is idempotent and
//! commutative, so duplicates converge) and fanned out to local
//! subscribers only — never re-published.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::awareness::AwarenessStore;
use crate::config::Config;
use crate::document::DocumentStore;
use crate::error::SyncError;
use crate::protocol::{
    AckPayload, AwarenessUpdatePayload, ClientId, ConnectionId, DeltaPayload, DocumentId,
    Message, MessageBody,
};
use crate::pubsub::{BusEvent, BusHandler, BusKind, PubSub};
use crate::realtime::connection::Connection;
use crate::realtime::registry::ConnectionRegistry;
use crate::storage::Storage;

// ---------------------------------------------------------------------------
// Pending state
// ---------------------------------------------------------------------------

/// One coalesced field write awaiting flush.
#[derive(Debug, Clone)]
struct BatchedWrite {
    value: Value,
    origin: ConnectionId,
    client_id: ClientId,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct PendingBatch {
    fields: HashMap<String, BatchedWrite>,
}

type AckKey = (ConnectionId, String);

struct AckSlot {
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SyncCoordinator {
    documents: Arc<DocumentStore>,
    awareness: Arc<AwarenessStore>,
    registry: Arc<ConnectionRegistry>,
    storage: Arc<dyn Storage>,
    bus: Arc<dyn PubSub>,
    batches: DashMap<DocumentId, PendingBatch>,
    acks: DashMap<AckKey, AckSlot>,
    batch_window: Duration,
    ack_timeout: Duration,
    max_ack_attempts: u32,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    pub fn new(
        config: &Config,
        documents: Arc<DocumentStore>,
        awareness: Arc<AwarenessStore>,
        registry: Arc<ConnectionRegistry>,
        storage: Arc<dyn Storage>,
        bus: Arc<dyn PubSub>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            documents,
            awareness,
            registry,
            storage,
            bus,
            batches: DashMap::new(),
            acks: DashMap::new(),
            batch_window: config.batch_window,
            ack_timeout: config.ack_timeout,
            max_ack_attempts: config.max_ack_attempts.max(1),
            cancel,
        })
    }

    pub fn documents(&self) -> &Arc<DocumentStore> {
        &self.documents
    }

    pub fn awareness(&self) -> &Arc<AwarenessStore> {
        &self.awareness
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<dyn PubSub> {
        &self.bus
    }

    // -----------------------------------------------------------------
    // Deltas
    // -----------------------------------------------------------------

    /// Apply a client delta: LWW, persistence, sender ACK, batch.
    pub async fn handle_delta(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        message_id: &str,
        timestamp: i64,
        payload: &DeltaPayload,
    ) -> Result<(), SyncError> {
        let fields = payload.fields();
        if fields.is_empty() {
            return Err(SyncError::Protocol("delta carries no fields".to_string()));
        }

        let document_id = payload.document_id.clone();
        let client_id = connection.client_id();

        let applied = self
            .documents
            .apply_delta(
                &document_id,
                message_id,
                &fields,
                &client_id,
                timestamp,
                payload.vector_clock.as_ref(),
            )
            .await;
        metrics::counter!("sync_deltas_applied_total", fields.len() as u64);

        // A writer that never subscribed is auto-subscribed so it sees
        // its own writes echoed back from other instances.
        if connection.add_subscription(&document_id) {
            self.documents.subscribe(&document_id, connection.id()).await;
            self.ensure_bus_subscription(&document_id).await;
        }

        self.spawn_persist(&document_id, &client_id, &applied);

        // Hop-by-hop ACK, always — even with zero fan-out targets.
        let ack = Message::new(MessageBody::Ack(AckPayload {
            message_id: message_id.to_string(),
        }));
        if let Err(e) = connection.send(&ack) {
            debug!(connection = %connection.id(), error = %e, "sender ack not delivered");
        }

        // Only accepted writes enter the batch; losers changed nothing.
        for (field, outcome) in &applied.outcomes {
            if !outcome.accepted {
                continue;
            }
            self.queue_batched_write(
                &document_id,
                field,
                BatchedWrite {
                    value: outcome.value.clone(),
                    origin: connection.id().to_string(),
                    client_id: client_id.clone(),
                    timestamp,
                },
            );
        }
        Ok(())
    }

    fn queue_batched_write(self: &Arc<Self>, document_id: &str, field: &str, write: BatchedWrite) {
        let mut schedule_flush = false;
        {
            let mut batch = self
                .batches
                .entry(document_id.to_string())
                .or_insert_with(|| {
                    schedule_flush = true;
                    PendingBatch::default()
                });
            // Later writes to the same field overwrite earlier ones.
            batch.fields.insert(field.to_string(), write);
        }

        if schedule_flush {
            let coordinator = self.clone();
            let document_id = document_id.to_string();
            let window = self.batch_window;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(window) => {
                        coordinator.flush_document(&document_id).await;
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }
    }

    /// Deliver a document's pending batch: one message per field to
    /// each local subscriber (minus that field's writer), one coalesced
    /// publish to the bus.
    pub async fn flush_document(self: &Arc<Self>, document_id: &str) {
        let Some((_, batch)) = self.batches.remove(document_id) else {
            return;
        };
        if batch.fields.is_empty() {
            return;
        }

        let (_, vector_clock) = self.documents.snapshot(document_id).await;
        let subscribers = self.registry.resolve(&self.documents.subscribers(document_id));

        for (field, write) in &batch.fields {
            // Receivers run LWW themselves; the envelope carries the
            // write's own timestamp, not the flush time.
            let message = Message {
                id: crate::util::new_message_id(),
                timestamp: write.timestamp,
                body: MessageBody::Delta(DeltaPayload {
                    document_id: document_id.to_string(),
                    delta: None,
                    field: Some(field.clone()),
                    value: Some(write.value.clone()),
                    client_id: Some(write.client_id.clone()),
                    vector_clock: Some(vector_clock.clone()),
                }),
            };
            for connection in &subscribers {
                if connection.id() == write.origin {
                    continue;
                }
                self.deliver_with_ack(connection, &message);
            }
        }

        // The coalesced cross-instance publish. Attribution follows the
        // latest write in the batch; values are the latest per field,
        // so replicas converge even when cell metadata differs.
        let latest = batch
            .fields
            .values()
            .max_by_key(|w| w.timestamp)
            .expect("non-empty batch");
        let coalesced: HashMap<String, Value> = batch
            .fields
            .iter()
            .map(|(field, write)| (field.clone(), write.value.clone()))
            .collect();
        let bus_message = Message {
            id: crate::util::new_message_id(),
            timestamp: latest.timestamp,
            body: MessageBody::Delta(DeltaPayload {
                document_id: document_id.to_string(),
                delta: Some(coalesced),
                field: None,
                value: None,
                client_id: Some(latest.client_id.clone()),
                vector_clock: Some(vector_clock),
            }),
        };
        if let Err(e) = self.bus.publish_delta(document_id, &bus_message).await {
            warn!(document = %document_id, error = %e, "bus publish failed");
        }
    }

    // -----------------------------------------------------------------
    // ACK tracking
    // -----------------------------------------------------------------

    /// Send and open a pending-ACK slot with retry.
    fn deliver_with_ack(self: &Arc<Self>, connection: &Arc<Connection>, message: &Message) {
        if connection.send(message).is_err() {
            return;
        }

        let key: AckKey = (connection.id().to_string(), message.id.clone());
        let slot_cancel = CancellationToken::new();
        self.acks.insert(
            key.clone(),
            AckSlot {
                cancel: slot_cancel.clone(),
            },
        );

        let coordinator = self.clone();
        let message = message.clone();
        let root_cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut attempts: u32 = 1;
            loop {
                tokio::select! {
                    _ = sleep(coordinator.ack_timeout) => {}
                    _ = slot_cancel.cancelled() => return,
                    _ = root_cancel.cancelled() => return,
                }

                if attempts >= coordinator.max_ack_attempts {
                    coordinator.acks.remove(&key);
                    metrics::counter!("sync_ack_timeouts_total", 1);
                    debug!(
                        connection = %key.0,
                        message = %key.1,
                        attempts,
                        "giving up on ack"
                    );
                    return;
                }

                let Some(target) = coordinator.registry.get(&key.0) else {
                    coordinator.acks.remove(&key);
                    return;
                };
                if target.send(&message).is_err() {
                    coordinator.acks.remove(&key);
                    return;
                }
                attempts += 1;
            }
        });
    }

    /// Match an incoming `ack` to its slot. ACKs from a connection that
    /// does not own the slot fall through and are ignored.
    pub fn resolve_ack(&self, connection_id: &str, message_id: &str) -> bool {
        match self
            .acks
            .remove(&(connection_id.to_string(), message_id.to_string()))
        {
            Some((_, slot)) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn pending_ack_count(&self) -> usize {
        self.acks.len()
    }

    fn cancel_acks_for(&self, connection_id: &str) {
        let keys: Vec<AckKey> = self
            .acks
            .iter()
            .filter(|entry| entry.key().0 == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, slot)) = self.acks.remove(&key) {
                slot.cancel.cancel();
            }
        }
    }

    // -----------------------------------------------------------------
    // Awareness
    // -----------------------------------------------------------------

    /// Apply a client's awareness update and, when accepted, echo it to
    /// the other local subscribers and the bus.
    pub async fn handle_awareness_update(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        payload: &AwarenessUpdatePayload,
    ) -> Result<(), SyncError> {
        let client_id = connection.client_id();
        let accepted = self.awareness.set(
            &payload.document_id,
            &client_id,
            payload.state.clone(),
            payload.clock,
        );
        if !accepted {
            return Ok(());
        }

        let message = Message::new(MessageBody::AwarenessUpdate(AwarenessUpdatePayload {
            document_id: payload.document_id.clone(),
            client_id: Some(client_id),
            state: payload.state.clone(),
            clock: payload.clock,
        }));
        self.fan_out_awareness(&payload.document_id, &message, Some(connection.id()));

        if let Err(e) = self
            .bus
            .publish_awareness(&payload.document_id, &message)
            .await
        {
            warn!(document = %payload.document_id, error = %e, "awareness bus publish failed");
        }
        Ok(())
    }

    /// Presence fan-out audience: document subscribers plus awareness
    /// subscribers, minus the excluded sender.
    fn fan_out_awareness(&self, document_id: &str, message: &Message, exclude: Option<&str>) {
        let mut audience = self.documents.subscribers(document_id);
        audience.extend(self.awareness.subscribers(document_id));
        audience.sort();
        audience.dedup();

        for connection in self.registry.resolve(&audience) {
            if exclude == Some(connection.id()) {
                continue;
            }
            if let Err(e) = connection.send(message) {
                debug!(connection = %connection.id(), error = %e, "awareness fan-out skipped");
            }
        }
    }

    /// Null-state broadcast for a departed or expired client. Local
    /// only: peer instances run their own reapers.
    pub fn broadcast_awareness_leave(
        &self,
        document_id: &str,
        client_id: &str,
        last_clock: u64,
        exclude: Option<&str>,
    ) {
        let message = Message::new(MessageBody::AwarenessUpdate(AwarenessUpdatePayload {
            document_id: document_id.to_string(),
            client_id: Some(client_id.to_string()),
            state: None,
            clock: last_clock + 1,
        }));
        self.fan_out_awareness(document_id, &message, exclude);
    }

    // -----------------------------------------------------------------
    // Bus integration
    // -----------------------------------------------------------------

    /// Join the bus channels for a document. Refcounted by the bus;
    /// call once per local subscriber.
    pub async fn ensure_bus_subscription(self: &Arc<Self>, document_id: &str) {
        let weak = Arc::downgrade(self);
        let handler: BusHandler = Arc::new(move |event| {
            if let Some(coordinator) = weak.upgrade() {
                tokio::spawn(async move {
                    coordinator.handle_bus_event(event).await;
                });
            }
        });
        if let Err(e) = self.bus.subscribe(document_id, handler).await {
            warn!(document = %document_id, error = %e, "bus subscribe failed");
        }
    }

    async fn release_bus_subscription(&self, document_id: &str) {
        if let Err(e) = self.bus.unsubscribe(document_id).await {
            warn!(document = %document_id, error = %e, "bus unsubscribe failed");
        }
    }

    /// A peer instance's publication: apply locally, fan out locally,
    /// never re-publish.
    pub async fn handle_bus_event(self: &Arc<Self>, event: BusEvent) {
        match (event.kind, &event.message.body) {
            (BusKind::Delta, MessageBody::Delta(payload)) => {
                let fields = payload.fields();
                if fields.is_empty() {
                    return;
                }
                let client_id = payload
                    .client_id
                    .clone()
                    .unwrap_or_else(|| "remote".to_string());

                let applied = self
                    .documents
                    .apply_delta(
                        &event.document_id,
                        &event.message.id,
                        &fields,
                        &client_id,
                        event.message.timestamp,
                        payload.vector_clock.as_ref(),
                    )
                    .await;

                let subscribers = self
                    .registry
                    .resolve(&self.documents.subscribers(&event.document_id));
                for (field, outcome) in &applied.outcomes {
                    if !outcome.accepted {
                        continue;
                    }
                    let message = Message {
                        id: crate::util::new_message_id(),
                        timestamp: event.message.timestamp,
                        body: MessageBody::Delta(DeltaPayload {
                            document_id: event.document_id.clone(),
                            delta: None,
                            field: Some(field.clone()),
                            value: Some(outcome.value.clone()),
                            client_id: Some(client_id.clone()),
                            vector_clock: Some(applied.vector_clock.clone()),
                        }),
                    };
                    for connection in &subscribers {
                        self.deliver_with_ack(connection, &message);
                    }
                }
            }
            (BusKind::Awareness, MessageBody::AwarenessUpdate(payload)) => {
                let Some(client_id) = payload.client_id.clone() else {
                    return;
                };
                let accepted = self.awareness.set(
                    &event.document_id,
                    &client_id,
                    payload.state.clone(),
                    payload.clock,
                );
                if accepted {
                    self.fan_out_awareness(&event.document_id, &event.message, None);
                }
            }
            _ => {
                debug!(
                    document = %event.document_id,
                    ty = event.message.message_type().name(),
                    "unexpected bus message type dropped"
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    fn spawn_persist(
        &self,
        document_id: &str,
        client_id: &str,
        applied: &crate::document::AppliedDelta,
    ) {
        let storage = self.storage.clone();
        let documents = self.documents.clone();
        let document_id = document_id.to_string();
        let client_id = client_id.to_string();
        let stored = applied.stored.clone();
        let clock_value = applied.vector_clock.get(&client_id);

        tokio::spawn(async move {
            if let Err(e) = storage.save_delta(&document_id, &stored).await {
                warn!(document = %document_id, error = %e, "delta persistence failed");
            }
            let (state, _) = documents.snapshot(&document_id).await;
            if let Err(e) = storage.save_document(&document_id, &state).await {
                warn!(document = %document_id, error = %e, "document persistence failed");
            }
            if let Err(e) = storage
                .update_vector_clock(&document_id, &client_id, clock_value)
                .await
            {
                warn!(document = %document_id, error = %e, "clock persistence failed");
            }
        });
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// The once-only connection teardown sequence: scrub subscriber
    /// sets, drop the client's awareness with a leave broadcast, cancel
    /// pending ACK slots, deregister.
    pub async fn teardown_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        if !connection.begin_teardown() {
            return;
        }
        let client_id = connection.client_id();
        debug!(connection = %connection.id(), client = %client_id, "tearing down connection");

        let mut scrubbed = std::collections::HashSet::new();
        for document_id in connection.subscriptions() {
            self.documents.unsubscribe(&document_id, connection.id());
            if let Some(entry) = self.awareness.remove(&document_id, &client_id) {
                self.broadcast_awareness_leave(
                    &document_id,
                    &client_id,
                    entry.clock,
                    Some(connection.id()),
                );
            }
            scrubbed.insert(document_id.clone());
            self.release_bus_subscription(&document_id).await;
        }

        for document_id in connection.awareness_subscriptions() {
            self.awareness.remove_subscriber(&document_id, connection.id());
            if scrubbed.insert(document_id.clone()) {
                if let Some(entry) = self.awareness.remove(&document_id, &client_id) {
                    self.broadcast_awareness_leave(
                        &document_id,
                        &client_id,
                        entry.clock,
                        Some(connection.id()),
                    );
                }
            }
            self.release_bus_subscription(&document_id).await;
        }
        self.awareness.remove_subscriber_everywhere(connection.id());

        self.cancel_acks_for(connection.id());
        self.registry.remove(connection.id());
        connection.cancel_token().cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::auth::TokenPayload;
    use crate::protocol::codec::ProtocolType;
    use crate::pubsub::LocalBus;
    use crate::realtime::connection::OutboundFrame;
    use crate::storage::InMemoryStorage;

    fn test_config() -> Config {
        Config {
            batch_window: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(40),
            max_ack_attempts: 2,
            ..Config::default()
        }
    }

    fn coordinator() -> Arc<SyncCoordinator> {
        coordinator_with_bus(Arc::new(LocalBus::standalone("synckit:")))
    }

    fn coordinator_with_bus(bus: Arc<dyn PubSub>) -> Arc<SyncCoordinator> {
        let config = test_config();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let documents = Arc::new(DocumentStore::new(storage.clone(), 1000));
        let awareness = Arc::new(AwarenessStore::new(30_000));
        let registry = Arc::new(ConnectionRegistry::new(100));
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

    fn client(
        coordinator: &Arc<SyncCoordinator>,
        id: &str,
        client_id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) = Connection::new(id.to_string(), 64, CancellationToken::new());
        conn.pin_protocol(ProtocolType::Text);
        conn.authenticate(TokenPayload::admin("tester"), Some(client_id.to_string()));
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

    fn delta_payload(doc: &str, field: &str, value: Value) -> DeltaPayload {
        DeltaPayload {
            document_id: doc.to_string(),
            delta: None,
            field: Some(field.to_string()),
            value: Some(value),
            client_id: None,
            vector_clock: None,
        }
    }

    #[tokio::test]
    async fn sender_is_acked_even_without_subscribers() {
        let coordinator = coordinator();
        let (conn, mut rx) = client(&coordinator, "c1", "A");

        coordinator
            .handle_delta(&conn, "m1", 1000, &delta_payload("doc-1", "title", json!("Hello")))
            .await
            .unwrap();

        let messages = drain(&mut rx);
        let acks: Vec<_> = messages
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::Ack(a) => Some(a.message_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec!["m1".to_string()]);

        let (state, clock) = coordinator.documents().snapshot("doc-1").await;
        assert_eq!(state.get("title"), Some(&json!("Hello")));
        assert_eq!(clock.get("A"), 1);
    }

    #[tokio::test]
    async fn batching_coalesces_to_one_message_per_field() {
        let coordinator = coordinator();
        let (writer, _writer_rx) = client(&coordinator, "c1", "A");
        let (reader, mut reader_rx) = client(&coordinator, "c2", "B");

        reader.add_subscription("doc-1");
        coordinator.documents().subscribe("doc-1", "c2").await;

        for (i, value) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            coordinator
                .handle_delta(
                    &writer,
                    &format!("m{i}"),
                    1000 + i as i64,
                    &delta_payload("doc-1", "title", json!(value)),
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        let deltas: Vec<_> = drain(&mut reader_rx)
            .into_iter()
            .filter_map(|m| match m.body {
                MessageBody::Delta(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(deltas.len(), 1, "five writes coalesce into one fan-out");
        assert_eq!(deltas[0].field.as_deref(), Some("title"));
        assert_eq!(deltas[0].value, Some(json!("E")));
    }

    #[tokio::test]
    async fn fan_out_excludes_the_writer() {
        let coordinator = coordinator();
        let (writer, mut writer_rx) = client(&coordinator, "c1", "A");
        let (reader, mut reader_rx) = client(&coordinator, "c2", "B");

        writer.add_subscription("doc-1");
        coordinator.documents().subscribe("doc-1", "c1").await;
        reader.add_subscription("doc-1");
        coordinator.documents().subscribe("doc-1", "c2").await;

        coordinator
            .handle_delta(&writer, "m1", 1000, &delta_payload("doc-1", "title", json!("x")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let writer_deltas = drain(&mut writer_rx)
            .into_iter()
            .filter(|m| matches!(m.body, MessageBody::Delta(_)))
            .count();
        assert_eq!(writer_deltas, 0);

        let reader_deltas = drain(&mut reader_rx)
            .into_iter()
            .filter(|m| matches!(m.body, MessageBody::Delta(_)))
            .count();
        assert_eq!(reader_deltas, 1);
    }

    #[tokio::test]
    async fn acks_resolve_and_cancel_retries() {
        let coordinator = coordinator();
        let (writer, _writer_rx) = client(&coordinator, "c1", "A");
        let (reader, mut reader_rx) = client(&coordinator, "c2", "B");

        reader.add_subscription("doc-1");
        coordinator.documents().subscribe("doc-1", "c2").await;

        coordinator
            .handle_delta(&writer, "m1", 1000, &delta_payload("doc-1", "f", json!(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let deltas: Vec<_> = drain(&mut reader_rx)
            .into_iter()
            .filter(|m| matches!(m.body, MessageBody::Delta(_)))
            .collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(coordinator.pending_ack_count(), 1);

        // Wrong connection: ignored.
        assert!(!coordinator.resolve_ack("c1", &deltas[0].id));
        assert_eq!(coordinator.pending_ack_count(), 1);

        // Right connection: slot removed, retries cancelled.
        assert!(coordinator.resolve_ack("c2", &deltas[0].id));
        assert_eq!(coordinator.pending_ack_count(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let resent = drain(&mut reader_rx)
            .into_iter()
            .filter(|m| matches!(m.body, MessageBody::Delta(_)))
            .count();
        assert_eq!(resent, 0, "no retry after ack");
    }

    #[tokio::test]
    async fn unacked_deliveries_retry_then_give_up() {
        let coordinator = coordinator();
        let (writer, _writer_rx) = client(&coordinator, "c1", "A");
        let (reader, mut reader_rx) = client(&coordinator, "c2", "B");

        reader.add_subscription("doc-1");
        coordinator.documents().subscribe("doc-1", "c2").await;

        coordinator
            .handle_delta(&writer, "m1", 1000, &delta_payload("doc-1", "f", json!(1)))
            .await
            .unwrap();

        // batch window + ack timeout + one retry + give-up window
        tokio::time::sleep(Duration::from_millis(200)).await;

        let deliveries = drain(&mut reader_rx)
            .into_iter()
            .filter(|m| matches!(m.body, MessageBody::Delta(_)))
            .count();
        // max_ack_attempts = 2: the original send plus one retry.
        assert_eq!(deliveries, 2);
        assert_eq!(coordinator.pending_ack_count(), 0);
    }

    #[tokio::test]
    async fn awareness_updates_fan_out_to_others_only() {
        let coordinator = coordinator();
        let (a, mut a_rx) = client(&coordinator, "c1", "A");
        let (b, mut b_rx) = client(&coordinator, "c2", "B");

        a.add_awareness_subscription("doc-1");
        coordinator.awareness().add_subscriber("doc-1", "c1");
        b.add_awareness_subscription("doc-1");
        coordinator.awareness().add_subscriber("doc-1", "c2");

        coordinator
            .handle_awareness_update(
                &a,
                &AwarenessUpdatePayload {
                    document_id: "doc-1".to_string(),
                    client_id: None,
                    state: Some(json!({"cursor": {"x": 10, "y": 20}})),
                    clock: 1,
                },
            )
            .await
            .unwrap();

        let b_updates: Vec<_> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|m| match m.body {
                MessageBody::AwarenessUpdate(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(b_updates.len(), 1);
        assert_eq!(b_updates[0].client_id.as_deref(), Some("A"));

        assert!(drain(&mut a_rx)
            .into_iter()
            .all(|m| !matches!(m.body, MessageBody::AwarenessUpdate(_))));
    }

    #[tokio::test]
    async fn stale_awareness_clock_is_dropped_silently() {
        let coordinator = coordinator();
        let (a, _a_rx) = client(&coordinator, "c1", "A");
        let (b, mut b_rx) = client(&coordinator, "c2", "B");

        b.add_awareness_subscription("doc-1");
        coordinator.awareness().add_subscriber("doc-1", "c2");

        let update = |clock: u64, v: i64| AwarenessUpdatePayload {
            document_id: "doc-1".to_string(),
            client_id: None,
            state: Some(json!(v)),
            clock,
        };
        coordinator.handle_awareness_update(&a, &update(2, 1)).await.unwrap();
        coordinator.handle_awareness_update(&a, &update(1, 99)).await.unwrap();

        let updates = drain(&mut b_rx)
            .into_iter()
            .filter(|m| matches!(m.body, MessageBody::AwarenessUpdate(_)))
            .count();
        assert_eq!(updates, 1);

        let active = coordinator.awareness().list_active("doc-1");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, Some(json!(1)));
    }

    #[tokio::test]
    async fn teardown_scrubs_every_trace() {
        let coordinator = coordinator();
        let (a, _a_rx) = client(&coordinator, "c1", "A");
        let (b, mut b_rx) = client(&coordinator, "c2", "B");

        a.add_subscription("doc-1");
        coordinator.documents().subscribe("doc-1", "c1").await;
        b.add_subscription("doc-1");
        coordinator.documents().subscribe("doc-1", "c2").await;
        coordinator.awareness().set("doc-1", "A", Some(json!(1)), 1);

        coordinator.teardown_connection(&a).await;

        assert!(!coordinator
            .documents()
            .subscribers("doc-1")
            .contains(&"c1".to_string()));
        assert!(coordinator.awareness().get("doc-1", "A").is_none());
        assert!(coordinator.registry().get("c1").is_none());

        // B saw the null-state leave with a bumped clock.
        let leaves: Vec<_> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|m| match m.body {
                MessageBody::AwarenessUpdate(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].state, None);
        assert_eq!(leaves[0].clock, 2);
        assert_eq!(leaves[0].client_id.as_deref(), Some("A"));

        // Running teardown again is a no-op.
        coordinator.teardown_connection(&a).await;
    }

    #[tokio::test]
    async fn empty_delta_is_a_protocol_error() {
        let coordinator = coordinator();
        let (conn, _rx) = client(&coordinator, "c1", "A");
        let err = coordinator
            .handle_delta(
                &conn,
                "m1",
                1000,
                &DeltaPayload {
                    document_id: "doc-1".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
