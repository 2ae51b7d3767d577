#![allow(dead_code)]
//! Shared fixtures for the integration suites: an in-process server
//! stack on the local bus, socketless client handles, and wire-message
//! drains.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use synckit_server::auth::TokenPayload;
use synckit_server::protocol::codec::{self, ProtocolType};
use synckit_server::protocol::{Message, MessageBody};
use synckit_server::pubsub::{LocalBus, LocalBusHub, PubSub};
use synckit_server::realtime::{Connection, OutboundFrame};
use synckit_server::server::ServerContext;
use synckit_server::storage::{InMemoryStorage, Storage};
use synckit_server::{Config, SyncServer};

pub fn test_config() -> Config {
    Config {
        auth_required: false,
        batch_window: Duration::from_millis(20),
        ack_timeout: Duration::from_millis(500),
        max_ack_attempts: 2,
        ..Config::default()
    }
}

/// One server instance attached to a shared hub, as if it were one
/// member of a fleet behind the same broker.
pub fn instance(hub: &Arc<LocalBusHub>, config: Config) -> Arc<ServerContext> {
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let bus: Arc<dyn PubSub> = Arc::new(LocalBus::new(hub.clone(), &config.redis_channel_prefix));
    SyncServer::build(config, storage, bus, CancellationToken::new(), None).context()
}

pub fn single_instance(config: Config) -> Arc<ServerContext> {
    instance(&LocalBusHub::new(), config)
}

/// A registered, admin-authenticated, text-pinned connection handle
/// with direct access to its outbound queue.
pub fn connect(
    context: &Arc<ServerContext>,
    connection_id: &str,
    client_id: &str,
) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
    let (connection, rx) = Connection::new(
        connection_id.to_string(),
        256,
        CancellationToken::new(),
    );
    connection.pin_protocol(ProtocolType::Text);
    connection.authenticate(TokenPayload::admin("tester"), Some(client_id.to_string()));
    context
        .coordinator
        .registry()
        .register(connection.clone())
        .expect("registry capacity");
    (connection, rx)
}

/// Decode every text frame currently buffered on the queue.
pub fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Text(text) = frame {
            messages.push(codec::decode_text(&text).expect("server emits valid frames"));
        }
    }
    messages
}

pub fn deltas(messages: &[Message]) -> Vec<synckit_server::protocol::DeltaPayload> {
    messages
        .iter()
        .filter_map(|m| match &m.body {
            MessageBody::Delta(d) => Some(d.clone()),
            _ => None,
        })
        .collect()
}

pub fn awareness_updates(
    messages: &[Message],
) -> Vec<synckit_server::protocol::AwarenessUpdatePayload> {
    messages
        .iter()
        .filter_map(|m| match &m.body {
            MessageBody::AwarenessUpdate(u) => Some(u.clone()),
            _ => None,
        })
        .collect()
}

/// Let batch windows and bus hops complete.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}
