//! Ephemeral presence state with clock ordering and TTL expiration.
//!
//! One [`AwarenessEntry`] per `(document, client)` pair. Updates carry
//! a per-client monotone clock; stale clocks are rejected so reordered
//! deliveries cannot resurrect old presence. Entries expire `ttl`
//! milliseconds after their last accepted update, and an expired entry
//! is indistinguishable from one that never existed.
//!
//! The store also owns the awareness-subscriber index: the connections
//! that asked for presence fan-out on a document.

use std::collections::HashSet;

use dashmap::DashMap;
use serde_json::Value;

use crate::protocol::{ClientId, ConnectionId, DocumentId, WireAwarenessEntry};
use crate::util::now_ms;

#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub document_id: DocumentId,
    pub client_id: ClientId,
    /// Presence payload; `None` is an explicit leave.
    pub state: Option<Value>,
    pub clock: u64,
    pub last_updated: i64,
    pub expires_at: i64,
}

impl AwarenessEntry {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Wire view for `awareness_state` replies.
    pub fn to_wire(&self) -> WireAwarenessEntry {
        WireAwarenessEntry {
            client_id: self.client_id.clone(),
            state: self.state.clone().unwrap_or(Value::Null),
            clock: self.clock,
            last_updated: self.last_updated,
        }
    }
}

pub struct AwarenessStore {
    entries: DashMap<(DocumentId, ClientId), AwarenessEntry>,
    subscribers: DashMap<DocumentId, HashSet<ConnectionId>>,
    ttl_ms: i64,
}

impl AwarenessStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entries: DashMap::new(),
            subscribers: DashMap::new(),
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    /// Insert or update an entry. Updates are accepted only when their
    /// clock is strictly greater than the existing one; accepted
    /// updates refresh the TTL. Returns whether the update landed.
    pub fn set(
        &self,
        document_id: &str,
        client_id: &str,
        state: Option<Value>,
        clock: u64,
    ) -> bool {
        self.set_at(document_id, client_id, state, clock, now_ms())
    }

    /// Clock-injected variant for deterministic tests.
    pub fn set_at(
        &self,
        document_id: &str,
        client_id: &str,
        state: Option<Value>,
        clock: u64,
        now: i64,
    ) -> bool {
        let key = (document_id.to_string(), client_id.to_string());
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if clock <= occupied.get().clock {
                    return false;
                }
                let entry = occupied.get_mut();
                entry.state = state;
                entry.clock = clock;
                entry.last_updated = now;
                entry.expires_at = now + self.ttl_ms;
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(AwarenessEntry {
                    document_id: document_id.to_string(),
                    client_id: client_id.to_string(),
                    state,
                    clock,
                    last_updated: now,
                    expires_at: now + self.ttl_ms,
                });
                true
            }
        }
    }

    pub fn get(&self, document_id: &str, client_id: &str) -> Option<AwarenessEntry> {
        self.entries
            .get(&(document_id.to_string(), client_id.to_string()))
            .map(|e| e.clone())
    }

    /// Live (unexpired, non-leave) entries for a document.
    pub fn list_active(&self, document_id: &str) -> Vec<AwarenessEntry> {
        self.list_active_at(document_id, now_ms())
    }

    pub fn list_active_at(&self, document_id: &str, now: i64) -> Vec<AwarenessEntry> {
        self.entries
            .iter()
            .filter(|e| {
                e.document_id == document_id && !e.is_expired_at(now) && e.state.is_some()
            })
            .map(|e| e.clone())
            .collect()
    }

    pub fn list_expired(&self) -> Vec<AwarenessEntry> {
        self.list_expired_at(now_ms())
    }

    pub fn list_expired_at(&self, now: i64) -> Vec<AwarenessEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.clone())
            .collect()
    }

    /// Drop every expired entry, returning what was removed.
    pub fn prune_expired(&self) -> Vec<AwarenessEntry> {
        self.prune_expired_at(now_ms())
    }

    pub fn prune_expired_at(&self, now: i64) -> Vec<AwarenessEntry> {
        let expired = self.list_expired_at(now);
        for entry in &expired {
            self.entries
                .remove(&(entry.document_id.clone(), entry.client_id.clone()));
        }
        expired
    }

    pub fn remove(&self, document_id: &str, client_id: &str) -> Option<AwarenessEntry> {
        self.entries
            .remove(&(document_id.to_string(), client_id.to_string()))
            .map(|(_, entry)| entry)
    }

    /// Drop every entry a client holds, across all documents.
    pub fn remove_all_for_client(&self, client_id: &str) -> Vec<AwarenessEntry> {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.client_id == client_id)
            .map(|e| (e.document_id.clone(), e.client_id.clone()))
            .collect();
        keys.iter()
            .filter_map(|key| self.entries.remove(key).map(|(_, entry)| entry))
            .collect()
    }

    // -----------------------------------------------------------------
    // Awareness subscribers
    // -----------------------------------------------------------------

    pub fn add_subscriber(&self, document_id: &str, connection_id: &str) {
        self.subscribers
            .entry(document_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub fn remove_subscriber(&self, document_id: &str, connection_id: &str) {
        if let Some(mut set) = self.subscribers.get_mut(document_id) {
            set.remove(connection_id);
        }
    }

    /// Scrub a connection from every document's subscriber set.
    pub fn remove_subscriber_everywhere(&self, connection_id: &str) {
        for mut set in self.subscribers.iter_mut() {
            set.remove(connection_id);
        }
    }

    pub fn subscribers(&self, document_id: &str) -> Vec<ConnectionId> {
        self.subscribers
            .get(document_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
