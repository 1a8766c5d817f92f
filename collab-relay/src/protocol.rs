//! JSON wire protocol between clients and the relay.
//!
//! Outbound frames come in two shapes:
//! ```text
//! control:  {"type":"connected"|"user_joined"|"user_left","room":"/r1","connections":2}
//! relayed:  {...client fields..., "deliveredAt":1718000000000}
//! ```
//!
//! Inbound frames are any JSON object. The relay never looks inside them
//! beyond checking that they parse; the CRDT engine on the clients owns the
//! payload format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;
use thiserror::Error;

/// Field the relay stamps onto every relayed event.
pub const DELIVERED_AT: &str = "deliveredAt";

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Frames synthesized by the relay itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sent only to a newly admitted member
    Connected { room: String, connections: usize },
    /// Sent to the other members after an admission
    UserJoined { room: String, connections: usize },
    /// Sent to the remaining members after a removal
    UserLeft { room: String, connections: usize },
}

impl ControlFrame {
    pub fn connected(room: &str, connections: usize) -> Self {
        Self::Connected {
            room: room.to_string(),
            connections,
        }
    }

    pub fn user_joined(room: &str, connections: usize) -> Self {
        Self::UserJoined {
            room: room.to_string(),
            connections,
        }
    }

    pub fn user_left(room: &str, connections: usize) -> Self {
        Self::UserLeft {
            room: room.to_string(),
            connections,
        }
    }

    /// Member count carried by this frame.
    pub fn connections(&self) -> usize {
        match self {
            Self::Connected { connections, .. }
            | Self::UserJoined { connections, .. }
            | Self::UserLeft { connections, .. } => *connections,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// A client event on its way to the other members of a room.
///
/// `fields` is the client's object minus any `deliveredAt` it supplied;
/// `delivered_at` is always the relay's receipt time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedEvent {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(rename = "deliveredAt")]
    pub delivered_at: u64,
}

impl RelayedEvent {
    /// Wrap a client object, overriding any client-supplied `deliveredAt`.
    pub fn new(mut fields: Map<String, Value>, delivered_at: u64) -> Self {
        fields.remove(DELIVERED_AT);
        Self {
            fields,
            delivered_at,
        }
    }

    /// Parse raw frame bytes and stamp them.
    pub fn from_frame(bytes: &[u8], delivered_at: u64) -> Result<Self, ProtocolError> {
        decode_object(bytes).map(|fields| Self::new(fields, delivered_at))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Parse an inbound frame. Only JSON objects can be shallow-merged with
/// `deliveredAt`, so every other JSON value is rejected.
pub fn decode_object(bytes: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::from_slice::<Value>(bytes).map_err(ProtocolError::Malformed)? {
        Value::Object(fields) => Ok(fields),
        Value::Array(_) => Err(ProtocolError::NotAnObject("array")),
        Value::String(_) => Err(ProtocolError::NotAnObject("string")),
        Value::Number(_) => Err(ProtocolError::NotAnObject("number")),
        Value::Bool(_) => Err(ProtocolError::NotAnObject("bool")),
        Value::Null => Err(ProtocolError::NotAnObject("null")),
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-connection receipt clock.
///
/// Wall time can step backwards; stamps from one connection never do.
#[derive(Debug, Default)]
pub struct ReceiptClock {
    last: u64,
}

impl ReceiptClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a frame received now.
    pub fn stamp(&mut self) -> u64 {
        self.observe(epoch_millis())
    }

    fn observe(&mut self, now: u64) -> u64 {
        self.last = self.last.max(now);
        self.last
    }
}
