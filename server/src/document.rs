//! Document state, delta log and Last-Write-Wins conflict resolution.
//!
//! A document is a map from field path to [`FieldCell`]. Every write is
//! decided by the lexicographic triple `(timestamp, clock, clientId)`:
//! strictly greater wins, and client ids break exact ties, so two
//! writers can never produce equal triples. Tombstones stay in the cell
//! map (they must keep losing writes out) but are dropped from the
//! snapshot clients see.
//!
//! All cross-document work releases one document's lock before touching
//! the next; no path ever holds two document locks at once.

use std::collections::{HashMap, HashSet, VecDeque};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::VectorClock;
use crate::protocol::{is_tombstone, ClientId, ConnectionId, DocumentId, TOMBSTONE};
use crate::storage::Storage;
use crate::util::now_ms;

// ---------------------------------------------------------------------------
// Cells and deltas
// ---------------------------------------------------------------------------

/// One field's authoritative value plus the LWW metadata that defends it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCell {
    pub value: Value,
    pub client_id: ClientId,
    pub clock: u64,
    pub timestamp: i64,
    pub tombstone: bool,
}

impl FieldCell {
    fn triple(&self) -> (i64, u64, &str) {
        (self.timestamp, self.clock, self.client_id.as_str())
    }
}

/// A delta as recorded in the log and replayed to late subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDelta {
    pub id: String,
    pub client_id: ClientId,
    pub timestamp: i64,
    pub fields: HashMap<String, Value>,
    pub vector_clock: VectorClock,
}

/// Result of one field-level LWW application.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Whether the incoming write replaced the cell.
    pub accepted: bool,
    /// The value that now occupies the cell — the incoming one when it
    /// won, the defender otherwise. Tombstones appear as the sentinel.
    pub value: Value,
    /// The document clock counter minted for this write.
    pub clock: u64,
}

/// Everything a single delta application produced, under one lock hold.
#[derive(Debug, Clone)]
pub struct AppliedDelta {
    pub outcomes: HashMap<String, WriteOutcome>,
    pub stored: StoredDelta,
    /// Document vector clock after increments and merge.
    pub vector_clock: VectorClock,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Document {
    state: HashMap<String, FieldCell>,
    vector_clock: VectorClock,
    delta_log: VecDeque<StoredDelta>,
    subscribers: HashSet<ConnectionId>,
    last_modified: i64,
}

impl Document {
    fn from_persisted(state: serde_json::Map<String, Value>, clock: VectorClock) -> Self {
        let cells = state
            .into_iter()
            .map(|(field, value)| {
                // Hydrated cells carry zeroed LWW metadata: any live
                // write dominates persisted history.
                let cell = FieldCell {
                    value,
                    client_id: String::new(),
                    clock: 0,
                    timestamp: 0,
                    tombstone: false,
                };
                (field, cell)
            })
            .collect();
        Self {
            state: cells,
            vector_clock: clock,
            delta_log: VecDeque::new(),
            subscribers: HashSet::new(),
            last_modified: now_ms(),
        }
    }

    /// Apply one field write (or delete, when `value` is the tombstone
    /// sentinel) under LWW.
    fn apply_field(
        &mut self,
        field: &str,
        value: &Value,
        client_id: &str,
        timestamp: i64,
    ) -> WriteOutcome {
        let clock = self.vector_clock.increment(client_id);
        let incoming = (timestamp, clock, client_id);

        let wins = match self.state.get(field) {
            Some(existing) => incoming > existing.triple(),
            None => true,
        };

        if !wins {
            let defender = self
                .state
                .get(field)
                .expect("losing write implies an existing cell");
            let value = if defender.tombstone {
                Value::String(TOMBSTONE.to_string())
            } else {
                defender.value.clone()
            };
            return WriteOutcome {
                accepted: false,
                value,
                clock,
            };
        }

        let tombstone = is_tombstone(value);
        self.state.insert(
            field.to_string(),
            FieldCell {
                value: value.clone(),
                client_id: client_id.to_string(),
                clock,
                timestamp,
                tombstone,
            },
        );
        self.last_modified = now_ms();

        WriteOutcome {
            accepted: true,
            value: value.clone(),
            clock,
        }
    }

    fn record_delta(&mut self, delta: StoredDelta, limit: usize) {
        self.delta_log.push_back(delta);
        while self.delta_log.len() > limit {
            self.delta_log.pop_front();
        }
    }

    /// Live field values; tombstoned cells are omitted.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.state
            .iter()
            .filter(|(_, cell)| !cell.tombstone)
            .map(|(field, cell)| (field.clone(), cell.value.clone()))
            .collect()
    }

    pub fn cell(&self, field: &str) -> Option<&FieldCell> {
        self.state.get(field)
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn subscribers(&self) -> &HashSet<ConnectionId> {
        &self.subscribers
    }

    pub fn delta_log_len(&self) -> usize {
        self.delta_log.len()
    }

    /// Every stored delta strictly after or concurrent with `since`,
    /// in log append order.
    pub fn deltas_since(&self, since: &VectorClock) -> Vec<StoredDelta> {
        self.delta_log
            .iter()
            .filter(|delta| {
                delta.vector_clock != *since && !delta.vector_clock.happens_before(since)
            })
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// Owns every [`Document`]. Documents are created on first reference
/// (hydrating from the storage collaborator when it has history) and
/// destroyed only by explicit admin delete.
pub struct DocumentStore {
    documents: DashMap<DocumentId, Arc<RwLock<Document>>>,
    storage: Arc<dyn Storage>,
    delta_log_limit: usize,
}

impl DocumentStore {
    pub fn new(storage: Arc<dyn Storage>, delta_log_limit: usize) -> Self {
        Self {
            documents: DashMap::new(),
            storage,
            delta_log_limit,
        }
    }

    /// Atomically create-if-absent, consulting storage on first miss.
    pub async fn get_or_create(&self, document_id: &str) -> Arc<RwLock<Document>> {
        if let Some(doc) = self.documents.get(document_id) {
            return doc.clone();
        }

        let hydrated = match self.storage.get_document(document_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(document = %document_id, error = %e, "hydration failed, starting empty");
                None
            }
        };

        // Another task may have created the document while we awaited.
        let entry = self
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| {
                let doc = match hydrated {
                    Some((state, clock)) => {
                        debug!(document = %document_id, "hydrated document from storage");
                        Document::from_persisted(state, clock)
                    }
                    None => Document::default(),
                };
                Arc::new(RwLock::new(doc))
            });
        entry.clone()
    }

    /// Existing document, never creating one.
    pub fn get(&self, document_id: &str) -> Option<Arc<RwLock<Document>>> {
        self.documents.get(document_id).map(|d| d.clone())
    }

    /// Apply a whole delta (one or many fields) under a single lock
    /// hold: per-field LWW, clock merge, log append.
    pub async fn apply_delta(
        &self,
        document_id: &str,
        delta_id: &str,
        fields: &HashMap<String, Value>,
        client_id: &str,
        timestamp: i64,
        incoming_clock: Option<&VectorClock>,
    ) -> AppliedDelta {
        let doc = self.get_or_create(document_id).await;
        let mut doc = doc.write();

        // Sorted application keeps minted clock values deterministic.
        let mut field_names: Vec<&String> = fields.keys().collect();
        field_names.sort();

        let mut outcomes = HashMap::with_capacity(fields.len());
        for field in field_names {
            let value = &fields[field];
            let outcome = doc.apply_field(field, value, client_id, timestamp);
            outcomes.insert(field.clone(), outcome);
        }

        if let Some(clock) = incoming_clock {
            doc.vector_clock.merge(clock);
        }

        let stored = StoredDelta {
            id: delta_id.to_string(),
            client_id: client_id.to_string(),
            timestamp,
            fields: fields.clone(),
            vector_clock: doc.vector_clock.clone(),
        };
        doc.record_delta(stored.clone(), self.delta_log_limit);

        AppliedDelta {
            outcomes,
            stored,
            vector_clock: doc.vector_clock.clone(),
        }
    }

    /// Single-field write. Returns the authoritative cell value.
    pub async fn apply_write(
        &self,
        document_id: &str,
        field: &str,
        value: Value,
        client_id: &str,
        timestamp: i64,
    ) -> WriteOutcome {
        let doc = self.get_or_create(document_id).await;
        let mut doc = doc.write();
        doc.apply_field(field, &value, client_id, timestamp)
    }

    /// Single-field delete: a write of the tombstone sentinel.
    pub async fn apply_delete(
        &self,
        document_id: &str,
        field: &str,
        client_id: &str,
        timestamp: i64,
    ) -> WriteOutcome {
        self.apply_write(
            document_id,
            field,
            Value::String(TOMBSTONE.to_string()),
            client_id,
            timestamp,
        )
        .await
    }

    pub async fn merge_clock(&self, document_id: &str, other: &VectorClock) {
        let doc = self.get_or_create(document_id).await;
        doc.write().vector_clock.merge(other);
    }

    pub async fn deltas_since(&self, document_id: &str, since: &VectorClock) -> Vec<StoredDelta> {
        let doc = self.get_or_create(document_id).await;
        let doc = doc.read();
        doc.deltas_since(since)
    }

    pub async fn subscribe(&self, document_id: &str, connection_id: &str) {
        let doc = self.get_or_create(document_id).await;
        doc.write().subscribers.insert(connection_id.to_string());
    }

    /// Remove a subscription without creating the document.
    pub fn unsubscribe(&self, document_id: &str, connection_id: &str) -> bool {
        match self.get(document_id) {
            Some(doc) => doc.write().subscribers.remove(connection_id),
            None => false,
        }
    }

    pub fn subscribers(&self, document_id: &str) -> Vec<ConnectionId> {
        match self.get(document_id) {
            Some(doc) => doc.read().subscribers.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Live state plus clock, for `sync_response`.
    pub async fn snapshot(
        &self,
        document_id: &str,
    ) -> (serde_json::Map<String, Value>, VectorClock) {
        let doc = self.get_or_create(document_id).await;
        let doc = doc.read();
        (doc.snapshot(), doc.vector_clock.clone())
    }

    /// Explicit admin delete — the only path that destroys a document.
    pub fn delete_document(&self, document_id: &str) -> bool {
        self.documents.remove(document_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::InMemoryStorage;

    fn store() -> DocumentStore {
        DocumentStore::new(Arc::new(InMemoryStorage::new()), 1000)
    }

    #[tokio::test]
    async fn first_write_lands() {
        let store = store();
        let outcome = store
            .apply_write("doc-1", "title", json!("Hello"), "A", 1000)
            .await;
        assert!(outcome.accepted);
        assert_eq!(outcome.value, json!("Hello"));
        assert_eq!(outcome.clock, 1);

        let (state, clock) = store.snapshot("doc-1").await;
        assert_eq!(state.get("title"), Some(&json!("Hello")));
        assert_eq!(clock.get("A"), 1);
    }

    #[tokio::test]
    async fn later_timestamp_wins() {
        let store = store();
        store.apply_write("doc-1", "title", json!("old"), "A", 10).await;
        let outcome = store
            .apply_write("doc-1", "title", json!("new"), "B", 20)
            .await;
        assert!(outcome.accepted);

        let stale = store
            .apply_write("doc-1", "title", json!("stale"), "A", 15)
            .await;
        assert!(!stale.accepted);
        assert_eq!(stale.value, json!("new"));
    }

    #[tokio::test]
    async fn client_id_breaks_exact_ties() {
        // Counters are per client, so both writes carry clock 1 and the
        // triples tie on (timestamp, clock): "B" > "A" decides, in
        // either arrival order.
        let store_a = store();
        store_a.apply_write("doc-1", "title", json!("X"), "A", 5000).await;
        let outcome = store_a
            .apply_write("doc-1", "title", json!("Y"), "B", 5000)
            .await;
        // (5000, 1, "B") > (5000, 1, "A")
        assert!(outcome.accepted);
        assert_eq!(outcome.value, json!("Y"));

        let reversed = store();
        reversed
            .apply_write("doc-1", "title", json!("Y"), "B", 5000)
            .await;
        let losing = reversed
            .apply_write("doc-1", "title", json!("X"), "A", 5000)
            .await;
        assert!(!losing.accepted);
        assert_eq!(losing.value, json!("Y"));
    }

    #[tokio::test]
    async fn replaying_same_deltas_in_any_order_converges() {
        let deltas: Vec<(&str, &str, Value, i64)> = vec![
            ("A", "title", json!("X"), 5000),
            ("B", "title", json!("Y"), 5000),
        ];

        let forward = store();
        for (client, field, value, ts) in &deltas {
            forward
                .apply_write("doc-1", field, value.clone(), client, *ts)
                .await;
        }

        let backward = store();
        for (client, field, value, ts) in deltas.iter().rev() {
            backward
                .apply_write("doc-1", field, value.clone(), client, *ts)
                .await;
        }

        // Both orders: the (5000, _, "B") and (5000, _, "A") candidates
        // resolve identically because each replica mints its own clock
        // but the multiset of (timestamp, clientId) pairs is equal.
        let (fwd, _) = forward.snapshot("doc-1").await;
        let (bwd, _) = backward.snapshot("doc-1").await;
        assert_eq!(fwd.get("title"), bwd.get("title"));
    }

    #[tokio::test]
    async fn tombstone_removes_from_snapshot_but_keeps_losing_writes_out() {
        let store = store();
        store.apply_write("doc-1", "title", json!("old"), "A", 10).await;

        let deleted = store.apply_delete("doc-1", "title", "A", 20).await;
        assert!(deleted.accepted);

        let (state, _) = store.snapshot("doc-1").await;
        assert!(!state.contains_key("title"));

        // An older concurrent write must still lose to the tombstone.
        let stale = store
            .apply_write("doc-1", "title", json!("zombie"), "B", 5)
            .await;
        assert!(!stale.accepted);
        assert_eq!(stale.value, json!(TOMBSTONE));
        let (state, _) = store.snapshot("doc-1").await;
        assert!(!state.contains_key("title"));
    }

    #[tokio::test]
    async fn delete_wins_then_loses_to_newer_write() {
        let store = store();
        store.apply_write("doc-1", "title", json!("old"), "A", 10).await;
        store.apply_delete("doc-1", "title", "A", 20).await;

        // At the tombstone's own timestamp the defender's higher
        // per-client clock (20, 2, "A") still beats B's (20, 1, "B").
        let tied = store
            .apply_write("doc-1", "title", json!("new"), "B", 20)
            .await;
        assert!(!tied.accepted);
        assert_eq!(tied.value, json!(TOMBSTONE));

        // A strictly later write revives the field.
        let outcome = store
            .apply_write("doc-1", "title", json!("new"), "B", 21)
            .await;
        assert!(outcome.accepted);
        let (state, _) = store.snapshot("doc-1").await;
        assert_eq!(state.get("title"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn idempotent_reapplication_leaves_state_unchanged() {
        let store = store();
        store.apply_write("doc-1", "title", json!("v"), "A", 100).await;
        let (before, _) = store.snapshot("doc-1").await;

        // Re-applying the same delta mints a higher clock with the same
        // timestamp+client, so it "wins" but writes an equal value.
        store.apply_write("doc-1", "title", json!("v"), "A", 100).await;
        let (after, _) = store.snapshot("doc-1").await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn apply_delta_merges_clock_and_records_log() {
        let store = store();
        let fields = HashMap::from([
            ("title".to_string(), json!("Hello")),
            ("body".to_string(), json!("text")),
        ]);
        let incoming = VectorClock::from([("remote", 7)]);
        let applied = store
            .apply_delta("doc-1", "d1", &fields, "A", 1000, Some(&incoming))
            .await;

        assert_eq!(applied.outcomes.len(), 2);
        assert!(applied.outcomes.values().all(|o| o.accepted));
        assert_eq!(applied.vector_clock.get("A"), 2);
        assert_eq!(applied.vector_clock.get("remote"), 7);
        assert_eq!(applied.stored.id, "d1");

        let doc = store.get("doc-1").unwrap();
        assert_eq!(doc.read().delta_log_len(), 1);
    }

    #[tokio::test]
    async fn deltas_since_returns_concurrent_and_later() {
        let store = store();
        let d1 = store
            .apply_delta(
                "doc-1",
                "d1",
                &HashMap::from([("a".to_string(), json!(1))]),
                "A",
                10,
                None,
            )
            .await;
        store
            .apply_delta(
                "doc-1",
                "d2",
                &HashMap::from([("b".to_string(), json!(2))]),
                "B",
                20,
                None,
            )
            .await;

        // A client that has seen d1 only needs d2.
        let missing = store.deltas_since("doc-1", &d1.vector_clock).await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, "d2");

        // A fresh client needs everything.
        let all = store.deltas_since("doc-1", &VectorClock::new()).await;
        assert_eq!(all.len(), 2);

        // A fully caught-up client needs nothing.
        let latest = store.get("doc-1").unwrap().read().vector_clock().clone();
        assert!(store.deltas_since("doc-1", &latest).await.is_empty());
    }

    #[tokio::test]
    async fn delta_log_is_bounded() {
        let store = DocumentStore::new(Arc::new(InMemoryStorage::new()), 3);
        for i in 0..10 {
            store
                .apply_delta(
                    "doc-1",
                    &format!("d{i}"),
                    &HashMap::from([("f".to_string(), json!(i))]),
                    "A",
                    i,
                    None,
                )
                .await;
        }
        let doc = store.get("doc-1").unwrap();
        assert_eq!(doc.read().delta_log_len(), 3);
        let log = doc.read().deltas_since(&VectorClock::new());
        assert_eq!(log.first().unwrap().id, "d7");
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe() {
        let store = store();
        store.subscribe("doc-1", "conn-1").await;
        store.subscribe("doc-1", "conn-2").await;
        assert_eq!(store.subscribers("doc-1").len(), 2);

        assert!(store.unsubscribe("doc-1", "conn-1"));
        assert!(!store.unsubscribe("doc-1", "conn-1"));
        assert_eq!(store.subscribers("doc-1"), vec!["conn-2".to_string()]);

        // Unsubscribing from an unknown document never creates it.
        assert!(!store.unsubscribe("ghost", "conn-1"));
        assert!(store.get("ghost").is_none());
    }

    #[tokio::test]
    async fn hydration_restores_persisted_state() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut state = serde_json::Map::new();
        state.insert("title".to_string(), json!("persisted"));
        storage.seed_document("doc-1", state, VectorClock::from([("A", 4)]));

        let store = DocumentStore::new(storage, 1000);
        let (snapshot, clock) = store.snapshot("doc-1").await;
        assert_eq!(snapshot.get("title"), Some(&json!("persisted")));
        assert_eq!(clock.get("A"), 4);

        // Live writes dominate hydrated cells.
        let outcome = store
            .apply_write("doc-1", "title", json!("fresh"), "B", 1)
            .await;
        assert!(outcome.accepted);
    }

    #[tokio::test]
    async fn delete_document_is_explicit() {
        let store = store();
        store.apply_write("doc-1", "f", json!(1), "A", 1).await;
        assert_eq!(store.len(), 1);
        assert!(store.delete_document("doc-1"));
        assert!(!store.delete_document("doc-1"));
        assert!(store.is_empty());
    }
}
