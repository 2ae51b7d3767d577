//! Cross-instance propagation fabric.
//!
//! Two channel families per document — `{prefix}delta:{docId}` and
//! `{prefix}awareness:{docId}` — carry text-framed wire messages
//! between server instances. Loopback suppression is the load-bearing
//! property: every published message id goes into a short-lived
//! "published by me" set, and an incoming message whose id is found
//! there is dropped, so the publishing instance never re-delivers its
//! own traffic to local subscribers.

pub mod local;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::protocol::Message;

pub use local::{LocalBus, LocalBusHub};
pub use redis::RedisBus;

/// How long a published message id is remembered for loopback
/// suppression.
pub const PUBLISHED_ID_TTL: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Delta,
    Awareness,
}

/// A message received from the bus, already decoded and past loopback
/// suppression.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: BusKind,
    pub document_id: String,
    pub message: Message,
}

/// Callback invoked for each incoming bus message. Handlers perform
/// local fan-out only — never re-publication.
pub type BusHandler = Arc<dyn Fn(BusEvent) + Send + Sync>;

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a delta fan-out message for a document, recording its id
    /// for loopback suppression.
    async fn publish_delta(&self, document_id: &str, message: &Message) -> Result<(), SyncError>;

    /// Publish an awareness fan-out message, same suppression contract.
    async fn publish_awareness(
        &self,
        document_id: &str,
        message: &Message,
    ) -> Result<(), SyncError>;

    /// Reference-counted: only the first subscriber of a document
    /// touches the underlying bus channels. The handler is shared
    /// across all documents and set by the first call.
    async fn subscribe(&self, document_id: &str, handler: BusHandler) -> Result<(), SyncError>;

    /// Drops one reference; the last one leaves the bus channels.
    async fn unsubscribe(&self, document_id: &str) -> Result<(), SyncError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);

    /// How many times the transport reconnected. Exposed for
    /// observability; in-process backends stay at zero.
    fn reconnect_count(&self) -> u64 {
        0
    }
}

/// `{prefix}delta:{docId}`
pub fn delta_channel(prefix: &str, document_id: &str) -> String {
    format!("{prefix}delta:{document_id}")
}

/// `{prefix}awareness:{docId}`
pub fn awareness_channel(prefix: &str, document_id: &str) -> String {
    format!("{prefix}awareness:{document_id}")
}

/// Reverse mapping from a channel name back to `(kind, documentId)`.
pub fn parse_channel(prefix: &str, channel: &str) -> Option<(BusKind, String)> {
    let rest = channel.strip_prefix(prefix)?;
    if let Some(doc) = rest.strip_prefix("delta:") {
        return Some((BusKind::Delta, doc.to_string()));
    }
    if let Some(doc) = rest.strip_prefix("awareness:") {
        return Some((BusKind::Awareness, doc.to_string()));
    }
    None
}
