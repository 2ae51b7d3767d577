//! Wire codec: two framings, one message set.
//!
//! Binary framing: `type(u8) | timestamp(i64 BE) | payloadLen(u32 BE) |
//! payload JSON (UTF-8)` — a 13-byte header followed by a JSON object
//! carrying the message `id` and the type-specific fields. Text
//! framing: a single JSON object with `type` (snake_case), `id`,
//! `timestamp` and the same payload fields inline.
//!
//! The framing of a connection is decided by its *first* inbound frame
//! ([`detect`]) and pinned for the connection's lifetime. A binary
//! first frame that does not parse falls back to text only when the
//! bytes are a valid UTF-8 JSON object; anything else is a fatal
//! framing error and the connection is closed.

use serde_json::Value;
use thiserror::Error;

use super::{
    AckPayload, AuthErrorPayload, AuthPayload, AuthSuccessPayload, AwarenessStatePayload,
    AwarenessSubscribePayload, AwarenessUpdatePayload, DeltaPayload, ErrorPayload, Message,
    MessageBody, MessageType, PingPayload, PongPayload, SubscribePayload, SyncRequestPayload,
    SyncResponsePayload, UnsubscribePayload,
};
use crate::error::SyncError;
use crate::util::now_ms;

/// Fixed binary header: type(1) + timestamp(8) + payloadLen(4).
pub const HEADER_LEN: usize = 13;

/// The framing pinned to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Binary,
    Text,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame shorter than the 13-byte binary header ({0} bytes)")]
    ShortFrame(usize),

    #[error("declared payload length {declared} does not match the {actual} remaining bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message type code {0:#04x}")]
    UnknownTypeCode(u8),

    #[error("unknown message type name {0:?}")]
    UnknownTypeName(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("first frame is neither binary-framed nor a UTF-8 JSON object")]
    UnrecognizedFraming,
}

impl DecodeError {
    /// Fatal errors corrupt framing and close the connection; the rest
    /// get a wire `error` reply while the connection stays open.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::ShortFrame(_)
                | DecodeError::LengthMismatch { .. }
                | DecodeError::UnrecognizedFraming
        )
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize for the given framing. Binary yields raw bytes; text
/// yields the JSON line's bytes.
pub fn encode(message: &Message, protocol: ProtocolType) -> Result<Vec<u8>, SyncError> {
    match protocol {
        ProtocolType::Binary => encode_binary(message),
        ProtocolType::Text => encode_text(message).map(String::into_bytes),
    }
}

pub fn encode_binary(message: &Message) -> Result<Vec<u8>, SyncError> {
    let mut payload = body_to_map(&message.body)?;
    payload.insert("id".to_string(), Value::String(message.id.clone()));
    let payload_bytes = serde_json::to_vec(&Value::Object(payload))
        .map_err(|e| SyncError::Internal(format!("payload serialization: {e}")))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload_bytes.len());
    frame.push(message.message_type().code());
    frame.extend_from_slice(&message.timestamp.to_be_bytes());
    frame.extend_from_slice(&(payload_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload_bytes);
    Ok(frame)
}

pub fn encode_text(message: &Message) -> Result<String, SyncError> {
    let mut object = body_to_map(&message.body)?;
    object.insert(
        "type".to_string(),
        Value::String(message.message_type().name().to_string()),
    );
    object.insert("id".to_string(), Value::String(message.id.clone()));
    object.insert("timestamp".to_string(), Value::from(message.timestamp));
    serde_json::to_string(&Value::Object(object))
        .map_err(|e| SyncError::Internal(format!("payload serialization: {e}")))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a frame under an already-pinned framing.
pub fn decode(bytes: &[u8], protocol: ProtocolType) -> Result<Message, DecodeError> {
    match protocol {
        ProtocolType::Binary => decode_binary(bytes),
        ProtocolType::Text => decode_text_bytes(bytes),
    }
}

pub fn decode_binary(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::ShortFrame(bytes.len()));
    }

    let declared = u32::from_be_bytes(
        bytes[9..13].try_into().expect("4-byte slice"),
    ) as usize;
    let actual = bytes.len() - HEADER_LEN;
    if declared != actual {
        return Err(DecodeError::LengthMismatch { declared, actual });
    }

    let ty = MessageType::from_code(bytes[0]).ok_or(DecodeError::UnknownTypeCode(bytes[0]))?;
    let timestamp = i64::from_be_bytes(bytes[1..9].try_into().expect("8-byte slice"));

    let payload: Value = serde_json::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
    let Value::Object(mut map) = payload else {
        return Err(DecodeError::MalformedPayload(
            "payload is not a JSON object".to_string(),
        ));
    };

    let id = take_id(&mut map)?;
    let body = body_from_map(ty, map)?;
    Ok(Message {
        id,
        timestamp,
        body,
    })
}

pub fn decode_text(text: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(DecodeError::MalformedPayload(
            "frame is not a JSON object".to_string(),
        ));
    };

    let type_name = match map.remove("type") {
        Some(Value::String(name)) => name,
        _ => {
            return Err(DecodeError::MalformedPayload(
                "missing \"type\" field".to_string(),
            ))
        }
    };
    let ty =
        MessageType::from_name(&type_name).ok_or(DecodeError::UnknownTypeName(type_name))?;

    let id = take_id(&mut map)?;
    // Missing timestamps default to receipt time rather than the epoch,
    // which would make every LWW comparison lose.
    let timestamp = match map.remove("timestamp") {
        Some(value) => value
            .as_i64()
            .ok_or_else(|| DecodeError::MalformedPayload("non-integer timestamp".to_string()))?,
        None => now_ms(),
    };

    let body = body_from_map(ty, map)?;
    Ok(Message {
        id,
        timestamp,
        body,
    })
}

fn decode_text_bytes(bytes: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::MalformedPayload("frame is not UTF-8".to_string()))?;
    decode_text(text)
}

/// Decide the framing from a connection's first inbound frame.
///
/// A structurally valid binary frame (header length and known type
/// code) pins binary. Otherwise the bytes must parse as a UTF-8 JSON
/// object, pinning text. A structurally valid binary frame with an
/// unknown type code that is *not* JSON still pins binary — the decode
/// step then produces the recoverable unknown-type error.
pub fn detect(bytes: &[u8]) -> Result<ProtocolType, DecodeError> {
    let binary_shaped = bytes.len() >= HEADER_LEN && {
        let declared =
            u32::from_be_bytes(bytes[9..13].try_into().expect("4-byte slice")) as usize;
        declared == bytes.len() - HEADER_LEN
    };

    if binary_shaped && MessageType::from_code(bytes[0]).is_some() {
        return Ok(ProtocolType::Binary);
    }

    let json_object = serde_json::from_slice::<Value>(bytes)
        .map(|v| v.is_object())
        .unwrap_or(false);
    if json_object {
        return Ok(ProtocolType::Text);
    }

    if binary_shaped {
        return Ok(ProtocolType::Binary);
    }

    Err(DecodeError::UnrecognizedFraming)
}

// ---------------------------------------------------------------------------
// Body <-> JSON object
// ---------------------------------------------------------------------------

fn take_id(map: &mut serde_json::Map<String, Value>) -> Result<String, DecodeError> {
    match map.remove("id") {
        Some(Value::String(id)) => Ok(id),
        Some(_) => Err(DecodeError::MalformedPayload(
            "non-string \"id\" field".to_string(),
        )),
        None => Err(DecodeError::MalformedPayload(
            "missing \"id\" field".to_string(),
        )),
    }
}

fn body_to_map(body: &MessageBody) -> Result<serde_json::Map<String, Value>, SyncError> {
    let value = match body {
        MessageBody::Auth(p) => serde_json::to_value(p),
        MessageBody::AuthSuccess(p) => serde_json::to_value(p),
        MessageBody::AuthError(p) => serde_json::to_value(p),
        MessageBody::Subscribe(p) => serde_json::to_value(p),
        MessageBody::Unsubscribe(p) => serde_json::to_value(p),
        MessageBody::SyncRequest(p) => serde_json::to_value(p),
        MessageBody::SyncResponse(p) => serde_json::to_value(p),
        MessageBody::Delta(p) => serde_json::to_value(p),
        MessageBody::Ack(p) => serde_json::to_value(p),
        MessageBody::Ping(p) => serde_json::to_value(p),
        MessageBody::Pong(p) => serde_json::to_value(p),
        MessageBody::AwarenessUpdate(p) => serde_json::to_value(p),
        MessageBody::AwarenessSubscribe(p) => serde_json::to_value(p),
        MessageBody::AwarenessState(p) => serde_json::to_value(p),
        MessageBody::Error(p) => serde_json::to_value(p),
    }
    .map_err(|e| SyncError::Internal(format!("payload serialization: {e}")))?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SyncError::Internal(
            "payload did not serialize to an object".to_string(),
        )),
    }
}

fn body_from_map(
    ty: MessageType,
    map: serde_json::Map<String, Value>,
) -> Result<MessageBody, DecodeError> {
    let value = Value::Object(map);
    let malformed = |e: serde_json::Error| DecodeError::MalformedPayload(e.to_string());

    Ok(match ty {
        MessageType::Auth => {
            MessageBody::Auth(serde_json::from_value::<AuthPayload>(value).map_err(malformed)?)
        }
        MessageType::AuthSuccess => MessageBody::AuthSuccess(
            serde_json::from_value::<AuthSuccessPayload>(value).map_err(malformed)?,
        ),
        MessageType::AuthError => MessageBody::AuthError(
            serde_json::from_value::<AuthErrorPayload>(value).map_err(malformed)?,
        ),
        MessageType::Subscribe => MessageBody::Subscribe(
            serde_json::from_value::<SubscribePayload>(value).map_err(malformed)?,
        ),
        MessageType::Unsubscribe => MessageBody::Unsubscribe(
            serde_json::from_value::<UnsubscribePayload>(value).map_err(malformed)?,
        ),
        MessageType::SyncRequest => MessageBody::SyncRequest(
            serde_json::from_value::<SyncRequestPayload>(value).map_err(malformed)?,
        ),
        MessageType::SyncResponse => MessageBody::SyncResponse(
            serde_json::from_value::<SyncResponsePayload>(value).map_err(malformed)?,
        ),
        MessageType::Delta => {
            MessageBody::Delta(serde_json::from_value::<DeltaPayload>(value).map_err(malformed)?)
        }
        MessageType::Ack => {
            MessageBody::Ack(serde_json::from_value::<AckPayload>(value).map_err(malformed)?)
        }
        MessageType::Ping => {
            MessageBody::Ping(serde_json::from_value::<PingPayload>(value).map_err(malformed)?)
        }
        MessageType::Pong => {
            MessageBody::Pong(serde_json::from_value::<PongPayload>(value).map_err(malformed)?)
        }
        MessageType::AwarenessUpdate => MessageBody::AwarenessUpdate(
            serde_json::from_value::<AwarenessUpdatePayload>(value).map_err(malformed)?,
        ),
        MessageType::AwarenessSubscribe => MessageBody::AwarenessSubscribe(
            serde_json::from_value::<AwarenessSubscribePayload>(value).map_err(malformed)?,
        ),
        MessageType::AwarenessState => MessageBody::AwarenessState(
            serde_json::from_value::<AwarenessStatePayload>(value).map_err(malformed)?,
        ),
        MessageType::Error => {
            MessageBody::Error(serde_json::from_value::<ErrorPayload>(value).map_err(malformed)?)
        }
    })
}
