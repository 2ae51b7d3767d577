//! Shared error taxonomy for the sync server.
//!
//! Handlers return [`SyncError`] and never panic across component
//! boundaries. The message router maps each variant onto the wire
//! behavior it demands: a recoverable `error` message, an `auth_error`
//! followed by a close, or a log line with no client-visible effect.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed frame, unknown type, oversized payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Missing, invalid or expired credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Authenticated but not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Awareness or delta traffic on a document the (non-admin)
    /// connection is not subscribed to.
    #[error("not subscribed to document {0}")]
    NotSubscribed(String),

    /// The global connection cap was reached.
    #[error("connection limit reached")]
    CapacityExceeded,

    /// The peer is gone; the outbound queue was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The outbound write queue is saturated. Callers must not retry
    /// on the same connection.
    #[error("outbound queue full")]
    QueueFull,

    /// Storage collaborator failure. Logged, never surfaced to clients.
    #[error("storage error: {0}")]
    Storage(String),

    /// Pub/sub fabric failure. The bus reconnects on its own.
    #[error("pubsub error: {0}")]
    PubSub(String),

    /// Anything unhandled inside a handler.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the router should answer with a wire `error` message
    /// while keeping the connection open.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(_)
                | SyncError::PermissionDenied(_)
                | SyncError::NotSubscribed(_)
                | SyncError::Internal(_)
        )
    }

    /// Short machine-readable code used in wire `error` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Protocol(_) => "protocol_error",
            SyncError::Auth(_) => "auth_failed",
            SyncError::PermissionDenied(_) => "permission_denied",
            SyncError::NotSubscribed(_) => "not_subscribed",
            SyncError::CapacityExceeded => "capacity_exceeded",
            SyncError::ConnectionClosed => "connection_closed",
            SyncError::QueueFull => "queue_full",
            SyncError::Storage(_) => "storage_error",
            SyncError::PubSub(_) => "pubsub_error",
            SyncError::Internal(_) => "internal_error",
        }
    }
}
