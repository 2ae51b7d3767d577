//! Per-socket connection state.
//!
//! A [`Connection`] is the registry-owned record of one WebSocket:
//! state machine, pinned wire framing, resolved identity, subscription
//! set, heartbeat bookkeeping and the outbound write queue. The socket
//! itself lives in the websocket module's tasks; everything else in
//! the server talks to the connection only through this handle, so the
//! socket is never written from two tasks at once — producers enqueue,
//! one writer drains.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenPayload;
use crate::error::SyncError;
use crate::protocol::codec::{self, ProtocolType};
use crate::protocol::{ClientId, ConnectionId, DocumentId, Message};
use crate::util::now_ms;

// WebSocket close codes used by the server.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticating = 1,
    Authenticated = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Authenticated,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// What the writer task actually puts on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Binary(Vec<u8>),
    Text(String),
    Close { code: u16, reason: String },
}

pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    protocol: OnceLock<ProtocolType>,
    auth: RwLock<Option<TokenPayload>>,
    client_id: OnceLock<ClientId>,
    subscriptions: RwLock<HashSet<DocumentId>>,
    awareness_subscriptions: RwLock<HashSet<DocumentId>>,
    last_activity: AtomicI64,
    outbound: mpsc::Sender<OutboundFrame>,
    teardown_started: AtomicBool,
    cancel: CancellationToken,
    connected_at: i64,
}

impl Connection {
    /// New connection in `Authenticating`, plus the receiving end of
    /// its write queue for the writer task.
    pub fn new(
        id: ConnectionId,
        queue_size: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::channel(queue_size.max(1));
        let now = now_ms();
        let connection = Arc::new(Self {
            id,
            state: AtomicU8::new(ConnectionState::Authenticating as u8),
            protocol: OnceLock::new(),
            auth: RwLock::new(None),
            client_id: OnceLock::new(),
            subscriptions: RwLock::new(HashSet::new()),
            awareness_subscriptions: RwLock::new(HashSet::new()),
            last_activity: AtomicI64::new(now),
            outbound,
            teardown_started: AtomicBool::new(false),
            cancel,
            connected_at: now,
        });
        (connection, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // -----------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Promote to `Authenticated` with the resolved identity. The
    /// client id is fixed here for the connection's lifetime: the
    /// client-proposed id when given, the connection id otherwise.
    pub fn authenticate(&self, token: TokenPayload, proposed_client_id: Option<ClientId>) {
        *self.auth.write() = Some(token);
        let client_id = proposed_client_id.unwrap_or_else(|| self.id.clone());
        let _ = self.client_id.set(client_id);
        self.set_state(ConnectionState::Authenticated);
    }

    pub fn token(&self) -> Option<TokenPayload> {
        self.auth.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.auth.read().as_ref().map(|t| t.user_id.clone())
    }

    /// The identity used for vector-clock attribution and awareness
    /// keys. Falls back to the connection id pre-auth.
    pub fn client_id(&self) -> ClientId {
        self.client_id.get().cloned().unwrap_or_else(|| self.id.clone())
    }

    // -----------------------------------------------------------------
    // Protocol pinning
    // -----------------------------------------------------------------

    /// Pin the framing decided by the first inbound frame. Later calls
    /// return the already-pinned framing.
    pub fn pin_protocol(&self, protocol: ProtocolType) -> ProtocolType {
        *self.protocol.get_or_init(|| protocol)
    }

    pub fn protocol(&self) -> Option<ProtocolType> {
        self.protocol.get().copied()
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    /// Encode with the pinned framing and enqueue. Fails when the
    /// framing is not yet pinned, the queue is saturated, or the
    /// connection is gone; callers never retry on the same connection.
    pub fn send(&self, message: &Message) -> Result<(), SyncError> {
        let protocol = self
            .protocol
            .get()
            .copied()
            .ok_or_else(|| SyncError::Internal("framing not pinned yet".to_string()))?;

        let frame = match protocol {
            ProtocolType::Binary => OutboundFrame::Binary(codec::encode_binary(message)?),
            ProtocolType::Text => OutboundFrame::Text(codec::encode_text(message)?),
        };

        metrics::counter!("sync_messages_sent_total", 1);
        self.enqueue(frame)
    }

    /// Enqueue a close frame; the writer task sends it and stops.
    pub fn close(&self, code: u16, reason: &str) {
        self.set_state(ConnectionState::Disconnecting);
        let _ = self.enqueue(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
        self.cancel.cancel();
    }

    fn enqueue(&self, frame: OutboundFrame) -> Result<(), SyncError> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SyncError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::ConnectionClosed),
        }
    }

    // -----------------------------------------------------------------
    // Heartbeat bookkeeping
    // -----------------------------------------------------------------

    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------

    pub fn add_subscription(&self, document_id: &str) -> bool {
        self.subscriptions.write().insert(document_id.to_string())
    }

    pub fn remove_subscription(&self, document_id: &str) -> bool {
        self.subscriptions.write().remove(document_id)
    }

    pub fn is_subscribed(&self, document_id: &str) -> bool {
        self.subscriptions.read().contains(document_id)
    }

    pub fn subscriptions(&self) -> Vec<DocumentId> {
        self.subscriptions.read().iter().cloned().collect()
    }

    pub fn add_awareness_subscription(&self, document_id: &str) -> bool {
        self.awareness_subscriptions
            .write()
            .insert(document_id.to_string())
    }

    pub fn awareness_subscriptions(&self) -> Vec<DocumentId> {
        self.awareness_subscriptions.read().iter().cloned().collect()
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// First caller wins; the teardown sequence runs exactly once even
    /// when close paths race.
    pub fn begin_teardown(&self) -> bool {
        let first = self
            .teardown_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.set_state(ConnectionState::Disconnected);
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBody, PingPayload};

    fn connection() -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        Connection::new("conn-test".to_string(), 8, CancellationToken::new())
    }

    #[test]
    fn starts_authenticating() {
        let (conn, _rx) = connection();
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn authenticate_fixes_client_id_for_lifetime() {
        let (conn, _rx) = connection();
        conn.authenticate(TokenPayload::admin("u1"), Some("client-a".to_string()));
        assert!(conn.is_authenticated());
        assert_eq!(conn.client_id(), "client-a");
        assert_eq!(conn.user_id().as_deref(), Some("u1"));

        // A second authentication cannot re-point the client id.
        conn.authenticate(TokenPayload::admin("u2"), Some("client-b".to_string()));
        assert_eq!(conn.client_id(), "client-a");
    }

    #[test]
    fn client_id_falls_back_to_connection_id() {
        let (conn, _rx) = connection();
        assert_eq!(conn.client_id(), "conn-test");
        conn.authenticate(TokenPayload::admin("u1"), None);
        assert_eq!(conn.client_id(), "conn-test");
    }

    #[test]
    fn protocol_pins_once() {
        let (conn, _rx) = connection();
        assert_eq!(conn.protocol(), None);
        assert_eq!(conn.pin_protocol(ProtocolType::Binary), ProtocolType::Binary);
        assert_eq!(conn.pin_protocol(ProtocolType::Text), ProtocolType::Binary);
        assert_eq!(conn.protocol(), Some(ProtocolType::Binary));
    }

    #[test]
    fn send_requires_pinned_framing() {
        let (conn, _rx) = connection();
        let message = Message::new(MessageBody::Ping(PingPayload {}));
        assert!(conn.send(&message).is_err());

        conn.pin_protocol(ProtocolType::Text);
        assert!(conn.send(&message).is_ok());
    }

    #[tokio::test]
    async fn send_uses_the_pinned_framing() {
        let (conn, mut rx) = connection();
        conn.pin_protocol(ProtocolType::Binary);
        conn.send(&Message::new(MessageBody::Ping(PingPayload {})))
            .unwrap();
        match rx.recv().await.unwrap() {
            OutboundFrame::Binary(bytes) => {
                assert!(codec::decode_binary(&bytes).is_ok());
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[test]
    fn saturated_queue_reports_failure() {
        let (conn, _rx) = Connection::new("conn-x".to_string(), 1, CancellationToken::new());
        conn.pin_protocol(ProtocolType::Text);
        let message = Message::new(MessageBody::Ping(PingPayload {}));
        assert!(conn.send(&message).is_ok());
        let err = conn.send(&message).unwrap_err();
        assert!(matches!(err, SyncError::QueueFull));
    }

    #[test]
    fn closed_queue_reports_failure() {
        let (conn, rx) = connection();
        drop(rx);
        conn.pin_protocol(ProtocolType::Text);
        let err = conn
            .send(&Message::new(MessageBody::Ping(PingPayload {})))
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionClosed));
    }

    #[tokio::test]
    async fn close_enqueues_frame_and_cancels() {
        let (conn, mut rx) = connection();
        conn.close(CLOSE_GOING_AWAY, "shutting down");
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
        assert!(conn.cancel_token().is_cancelled());
        match rx.recv().await.unwrap() {
            OutboundFrame::Close { code, reason } => {
                assert_eq!(code, CLOSE_GOING_AWAY);
                assert_eq!(reason, "shutting down");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn subscription_set_tracks_membership() {
        let (conn, _rx) = connection();
        assert!(conn.add_subscription("doc-1"));
        assert!(!conn.add_subscription("doc-1"));
        assert!(conn.is_subscribed("doc-1"));
        assert!(conn.remove_subscription("doc-1"));
        assert!(!conn.is_subscribed("doc-1"));
    }

    #[test]
    fn teardown_runs_exactly_once() {
        let (conn, _rx) = connection();
        assert!(conn.begin_teardown());
        assert!(!conn.begin_teardown());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn touch_advances_last_activity() {
        let (conn, _rx) = connection();
        let before = conn.last_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        conn.touch();
        assert!(conn.last_activity() >= before);
    }
}
