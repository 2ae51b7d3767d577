//! Wire message set.
//!
//! Exactly fifteen message types travel in both framings (binary and
//! text, see [`codec`]). Every outbound message carries a unique `id`
//! and a millisecond `timestamp`; payload keys are camelCase JSON,
//! type names are snake_case strings in the text framing and one-byte
//! codes in the binary framing.

pub mod codec;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::VectorClock;
use crate::document::StoredDelta;
use crate::util::{new_message_id, now_ms};

pub type DocumentId = String;
pub type ClientId = String;
pub type ConnectionId = String;

/// Sentinel value marking a deleted field. Participates in LWW like any
/// other value; the live state map drops the field when it wins.
pub const TOMBSTONE: &str = "__tombstone__";

/// Whether a JSON value is the deletion sentinel.
pub fn is_tombstone(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == TOMBSTONE)
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Auth = 0x01,
    AuthSuccess = 0x02,
    AuthError = 0x03,
    Subscribe = 0x04,
    Unsubscribe = 0x05,
    SyncRequest = 0x06,
    SyncResponse = 0x07,
    Delta = 0x08,
    Ack = 0x09,
    Ping = 0x0A,
    Pong = 0x0B,
    AwarenessUpdate = 0x0C,
    AwarenessSubscribe = 0x0D,
    AwarenessState = 0x0E,
    Error = 0x0F,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => MessageType::Auth,
            0x02 => MessageType::AuthSuccess,
            0x03 => MessageType::AuthError,
            0x04 => MessageType::Subscribe,
            0x05 => MessageType::Unsubscribe,
            0x06 => MessageType::SyncRequest,
            0x07 => MessageType::SyncResponse,
            0x08 => MessageType::Delta,
            0x09 => MessageType::Ack,
            0x0A => MessageType::Ping,
            0x0B => MessageType::Pong,
            0x0C => MessageType::AwarenessUpdate,
            0x0D => MessageType::AwarenessSubscribe,
            0x0E => MessageType::AwarenessState,
            0x0F => MessageType::Error,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Auth => "auth",
            MessageType::AuthSuccess => "auth_success",
            MessageType::AuthError => "auth_error",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::SyncRequest => "sync_request",
            MessageType::SyncResponse => "sync_response",
            MessageType::Delta => "delta",
            MessageType::Ack => "ack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::AwarenessUpdate => "awareness_update",
            MessageType::AwarenessSubscribe => "awareness_subscribe",
            MessageType::AwarenessState => "awareness_state",
            MessageType::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "auth" => MessageType::Auth,
            "auth_success" => MessageType::AuthSuccess,
            "auth_error" => MessageType::AuthError,
            "subscribe" => MessageType::Subscribe,
            "unsubscribe" => MessageType::Unsubscribe,
            "sync_request" => MessageType::SyncRequest,
            "sync_response" => MessageType::SyncResponse,
            "delta" => MessageType::Delta,
            "ack" => MessageType::Ack,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "awareness_update" => MessageType::AwarenessUpdate,
            "awareness_subscribe" => MessageType::AwarenessSubscribe,
            "awareness_state" => MessageType::AwarenessState,
            "error" => MessageType::Error,
            _ => return None,
        })
    }

    pub const ALL: [MessageType; 15] = [
        MessageType::Auth,
        MessageType::AuthSuccess,
        MessageType::AuthError,
        MessageType::Subscribe,
        MessageType::Unsubscribe,
        MessageType::SyncRequest,
        MessageType::SyncResponse,
        MessageType::Delta,
        MessageType::Ack,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::AwarenessUpdate,
        MessageType::AwarenessSubscribe,
        MessageType::AwarenessState,
        MessageType::Error,
    ];
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Client-proposed stable identity; falls back to the connection id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccessPayload {
    pub user_id: String,
    pub client_id: ClientId,
    pub permissions: WirePermissions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePermissions {
    pub can_read: Vec<DocumentId>,
    pub can_write: Vec<DocumentId>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthErrorPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub document_id: DocumentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePayload {
    pub document_id: DocumentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    pub document_id: DocumentId,
    /// Client's clock; the server replies with everything after it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponsePayload {
    pub document_id: DocumentId,
    /// Live field values (tombstoned fields omitted).
    pub state: serde_json::Map<String, Value>,
    pub vector_clock: VectorClock,
    /// Deltas the requesting client is missing, in log order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deltas: Option<Vec<StoredDelta>>,
}

/// Inbound/outbound field mutations. The server accepts both the
/// object-shaped (`delta`) and the degenerate single-field
/// (`field` + `value`) forms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub document_id: DocumentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
}

impl DeltaPayload {
    /// Normalize both wire shapes into one field map.
    pub fn fields(&self) -> HashMap<String, Value> {
        if let Some(delta) = &self.delta {
            return delta.clone();
        }
        match (&self.field, &self.value) {
            (Some(field), Some(value)) => {
                HashMap::from([(field.clone(), value.clone())])
            }
            _ => HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Id of the message being acknowledged.
    pub message_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessUpdatePayload {
    pub document_id: DocumentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Presence state; `null` is an explicit leave.
    pub state: Option<Value>,
    /// Monotone per-client awareness clock.
    pub clock: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessSubscribePayload {
    pub document_id: DocumentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessStatePayload {
    pub document_id: DocumentId,
    pub entries: Vec<WireAwarenessEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAwarenessEntry {
    pub client_id: ClientId,
    pub state: Value,
    pub clock: u64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Auth(AuthPayload),
    AuthSuccess(AuthSuccessPayload),
    AuthError(AuthErrorPayload),
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    SyncRequest(SyncRequestPayload),
    SyncResponse(SyncResponsePayload),
    Delta(DeltaPayload),
    Ack(AckPayload),
    Ping(PingPayload),
    Pong(PongPayload),
    AwarenessUpdate(AwarenessUpdatePayload),
    AwarenessSubscribe(AwarenessSubscribePayload),
    AwarenessState(AwarenessStatePayload),
    Error(ErrorPayload),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Auth(_) => MessageType::Auth,
            MessageBody::AuthSuccess(_) => MessageType::AuthSuccess,
            MessageBody::AuthError(_) => MessageType::AuthError,
            MessageBody::Subscribe(_) => MessageType::Subscribe,
            MessageBody::Unsubscribe(_) => MessageType::Unsubscribe,
            MessageBody::SyncRequest(_) => MessageType::SyncRequest,
            MessageBody::SyncResponse(_) => MessageType::SyncResponse,
            MessageBody::Delta(_) => MessageType::Delta,
            MessageBody::Ack(_) => MessageType::Ack,
            MessageBody::Ping(_) => MessageType::Ping,
            MessageBody::Pong(_) => MessageType::Pong,
            MessageBody::AwarenessUpdate(_) => MessageType::AwarenessUpdate,
            MessageBody::AwarenessSubscribe(_) => MessageType::AwarenessSubscribe,
            MessageBody::AwarenessState(_) => MessageType::AwarenessState,
            MessageBody::Error(_) => MessageType::Error,
        }
    }
}

/// One wire message: unique id, millisecond timestamp, typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub timestamp: i64,
    pub body: MessageBody,
}

impl Message {
    /// New message with a fresh id and the current timestamp.
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: new_message_id(),
            timestamp: now_ms(),
            body,
        }
    }

    /// New message reusing an existing id (pong echoes, retries).
    pub fn with_id(id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            id: id.into(),
            timestamp: now_ms(),
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Convenience constructor for wire `error` replies.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Message::new(MessageBody::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
        }))
    }
}
