//! Connection registry: the single owner of every [`Connection`].
//!
//! Indexes connections by id and by user id; the by-document view is
//! derived by resolving a document's subscriber set against `by_id`,
//! so there is no third index to keep consistent. Registration
//! enforces the global connection cap.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::connection::{Connection, CLOSE_GOING_AWAY};
use crate::error::SyncError;
use crate::protocol::ConnectionId;

pub struct ConnectionRegistry {
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    by_user: DashMap<String, HashSet<ConnectionId>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            max_connections,
        }
    }

    /// Admit a connection, enforcing the global cap. Rejected callers
    /// close the socket with a policy-violation code.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), SyncError> {
        if self.by_id.len() >= self.max_connections {
            metrics::counter!("sync_connections_rejected_total", 1);
            return Err(SyncError::CapacityExceeded);
        }
        debug!(connection = %connection.id(), "connection registered");
        self.by_id.insert(connection.id().to_string(), connection);
        metrics::increment_gauge!("sync_connections_active", 1.0);
        Ok(())
    }

    /// Add the user index entry once a connection authenticates.
    pub fn index_user(&self, user_id: &str, connection_id: &str) {
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = self.by_id.remove(connection_id).map(|(_, conn)| conn);
        if let Some(conn) = &removed {
            metrics::decrement_gauge!("sync_connections_active", 1.0);
            if let Some(user_id) = conn.user_id() {
                let empty = match self.by_user.get_mut(&user_id) {
                    Some(mut set) => {
                        set.remove(connection_id);
                        set.is_empty()
                    }
                    None => false,
                };
                if empty {
                    self.by_user.remove(&user_id);
                }
            }
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.by_id.get(connection_id).map(|c| c.clone())
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Resolve a set of connection ids (typically a document's
    /// subscriber set) to live connections, dropping stale entries.
    pub fn resolve(&self, connection_ids: &[ConnectionId]) -> Vec<Arc<Connection>> {
        connection_ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Graceful shutdown: tell every peer we are going away.
    pub fn close_all(&self, reason: &str) {
        info!(connections = self.by_id.len(), "closing all connections");
        for entry in self.by_id.iter() {
            entry.value().close(CLOSE_GOING_AWAY, reason);
        }
    }
}
