//! Persistence collaborator interface.
//!
//! The server is memory-authoritative within a process lifetime;
//! storage is best effort. Failures are logged by callers and never
//! block in-memory progress or surface to clients.

pub mod postgres;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::clock::VectorClock;
use crate::document::StoredDelta;
use crate::error::SyncError;
use crate::protocol::DocumentId;

pub use postgres::PostgresStorage;

/// Pluggable persistence backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist the full live state of a document.
    async fn save_document(
        &self,
        document_id: &str,
        state: &serde_json::Map<String, Value>,
    ) -> Result<(), SyncError>;

    /// Persist one vector clock entry.
    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        value: u64,
    ) -> Result<(), SyncError>;

    /// Append one delta to the document's persisted log.
    async fn save_delta(&self, document_id: &str, delta: &StoredDelta) -> Result<(), SyncError>;

    /// Load a document's state and clock, if it was ever persisted.
    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<(serde_json::Map<String, Value>, VectorClock)>, SyncError>;

    /// Persisted deltas strictly after or concurrent with `since`.
    async fn get_deltas_since(
        &self,
        document_id: &str,
        since: &VectorClock,
    ) -> Result<Vec<StoredDelta>, SyncError>;

    /// Release underlying resources.
    async fn disconnect(&self) -> Result<(), SyncError>;

    /// Backend identifier for logs.
    fn backend_name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryDocument {
    state: serde_json::Map<String, Value>,
    clock: VectorClock,
    deltas: Vec<StoredDelta>,
}

/// Process-local backend for single-instance runs and tests.
#[derive(Default)]
pub struct InMemoryStorage {
    documents: DashMap<DocumentId, MemoryDocument>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a document, as if a previous process had persisted it.
    pub fn seed_document(
        &self,
        document_id: &str,
        state: serde_json::Map<String, Value>,
        clock: VectorClock,
    ) {
        self.documents.insert(
            document_id.to_string(),
            MemoryDocument {
                state,
                clock,
                deltas: Vec::new(),
            },
        );
    }

    pub fn delta_count(&self, document_id: &str) -> usize {
        self.documents
            .get(document_id)
            .map(|d| d.deltas.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_document(
        &self,
        document_id: &str,
        state: &serde_json::Map<String, Value>,
    ) -> Result<(), SyncError> {
        let mut doc = self.documents.entry(document_id.to_string()).or_default();
        doc.state = state.clone();
        Ok(())
    }

    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        value: u64,
    ) -> Result<(), SyncError> {
        let mut doc = self.documents.entry(document_id.to_string()).or_default();
        doc.clock.merge(&VectorClock::from([(client_id, value)]));
        Ok(())
    }

    async fn save_delta(&self, document_id: &str, delta: &StoredDelta) -> Result<(), SyncError> {
        let mut doc = self.documents.entry(document_id.to_string()).or_default();
        doc.deltas.push(delta.clone());
        Ok(())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<(serde_json::Map<String, Value>, VectorClock)>, SyncError> {
        Ok(self
            .documents
            .get(document_id)
            .map(|doc| (doc.state.clone(), doc.clock.clone())))
    }

    async fn get_deltas_since(
        &self,
        document_id: &str,
        since: &VectorClock,
    ) -> Result<Vec<StoredDelta>, SyncError> {
        Ok(self
            .documents
            .get(document_id)
            .map(|doc| {
                doc.deltas
                    .iter()
                    .filter(|d| d.vector_clock != *since && !d.vector_clock.happens_before(since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn disconnect(&self) -> Result<(), SyncError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Null backend
// ---------------------------------------------------------------------------

/// Discards everything. Used when no database is configured.
pub struct NullStorage;

#[async_trait]
impl Storage for NullStorage {
    async fn save_document(
        &self,
        _document_id: &str,
        _state: &serde_json::Map<String, Value>,
    ) -> Result<(), SyncError> {
        Ok(())
    }

    async fn update_vector_clock(
        &self,
        _document_id: &str,
        _client_id: &str,
        _value: u64,
    ) -> Result<(), SyncError> {
        Ok(())
    }

    async fn save_delta(&self, _document_id: &str, _delta: &StoredDelta) -> Result<(), SyncError> {
        Ok(())
    }

    async fn get_document(
        &self,
        _document_id: &str,
    ) -> Result<Option<(serde_json::Map<String, Value>, VectorClock)>, SyncError> {
        Ok(None)
    }

    async fn get_deltas_since(
        &self,
        _document_id: &str,
        _since: &VectorClock,
    ) -> Result<Vec<StoredDelta>, SyncError> {
        Ok(Vec::new())
    }

    async fn disconnect(&self) -> Result<(), SyncError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "null"
    }
}
