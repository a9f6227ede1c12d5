//! JSON envelope protocol for the real-time room channel.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! { "type": "code_update", "data": { "code": "x = 1" }, "timestamp": "2026-01-01T00:00:00+00:00" }
//! ```
//!
//! Inbound frames are decoded into [`ClientEvent`], outbound messages are
//! built as [`ServerEvent`]. Both enumerations are closed: adding a message
//! type means adding a variant, and every `match` over them must handle it.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key/value payload carried in an envelope's `data` field.
pub type Payload = Map<String, Value>;

/// Error text sent back for a frame that is not valid JSON.
pub const MSG_INVALID_JSON: &str = "Invalid JSON format";
/// Error text sent back for a frame without a usable `type`/`data` shape.
pub const MSG_INVALID_STRUCTURE: &str = "Invalid message structure";
/// Error text sent back for a `code_update` without a string `code`.
pub const MSG_INVALID_CODE_UPDATE: &str = "Invalid code_update format";
/// Error text sent back when the code could not be persisted.
pub const MSG_SAVE_FAILED: &str = "Failed to save code";

/// Wire-level message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Payload,
    pub timestamp: String,
}

impl Envelope {
    /// Build an envelope stamped with the current server time.
    pub fn now(kind: impl Into<String>, data: Payload) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse an envelope produced by [`Envelope::encode`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

/// Protocol-level faults. All of them are reported to the sender only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid message structure")]
    InvalidStructure,
    #[error("code_update without a string `code` field")]
    InvalidCodeUpdate,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Text placed in the `error` envelope returned to the sender.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => MSG_INVALID_JSON,
            Self::InvalidStructure => MSG_INVALID_STRUCTURE,
            Self::InvalidCodeUpdate => MSG_INVALID_CODE_UPDATE,
            Self::Serialization(_) => MSG_INVALID_STRUCTURE,
        }
    }
}

/// Inbound event from a participant.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Full-buffer replacement. `data` is the payload as received, echoed on fan-out.
    CodeUpdate { code: String, data: Payload },
    CursorPosition(Payload),
    /// Re-broadcast stamped with the sender's participant id and display name.
    CursorUpdate(Payload),
    /// A structurally valid envelope whose type the server does not handle.
    Unknown(String),
}

impl ClientEvent {
    /// Decode one raw text frame.
    ///
    /// A missing or `null` `data` is an empty payload. Any other non-object
    /// `data`, or a missing/non-string `type`, is a structural error.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let Value::Object(mut message) = value else {
            return Err(ProtocolError::InvalidStructure);
        };

        let kind = match message.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::InvalidStructure),
        };

        let data = match message.remove("data") {
            None | Some(Value::Null) => Payload::new(),
            Some(Value::Object(data)) => data,
            Some(_) => return Err(ProtocolError::InvalidStructure),
        };

        match kind.as_str() {
            "code_update" => match data.get("code") {
                Some(Value::String(code)) => Ok(Self::CodeUpdate {
                    code: code.clone(),
                    data,
                }),
                _ => Err(ProtocolError::InvalidCodeUpdate),
            },
            "cursor_position" => Ok(Self::CursorPosition(data)),
            "cursor_update" => Ok(Self::CursorUpdate(data)),
            _ => Ok(Self::Unknown(kind)),
        }
    }

    /// Decode a binary frame. Non-UTF-8 bytes are treated as invalid JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Self::decode(text)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::CodeUpdate { .. } => "code_update",
            Self::CursorPosition(_) => "cursor_position",
            Self::CursorUpdate(_) => "cursor_update",
            Self::Unknown(kind) => kind,
        }
    }
}

/// Outbound event from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Init {
        room_id: String,
        code: String,
        language: String,
    },
    UserJoined {
        room_id: String,
        user_count: usize,
    },
    UserLeft {
        room_id: String,
        user_id: String,
        user_count: usize,
    },
    Error {
        message: String,
    },
    CodeUpdate(Payload),
    CursorPosition(Payload),
    CursorUpdate(Payload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::Error { .. } => "error",
            Self::CodeUpdate(_) => "code_update",
            Self::CursorPosition(_) => "cursor_position",
            Self::CursorUpdate(_) => "cursor_update",
        }
    }

    /// Convert into a timestamped envelope.
    pub fn into_envelope(self) -> Envelope {
        let kind = self.kind();
        let data = match self {
            Self::Init {
                room_id,
                code,
                language,
            } => {
                let mut data = Payload::new();
                data.insert("room_id".into(), Value::String(room_id));
                data.insert("code".into(), Value::String(code));
                data.insert("language".into(), Value::String(language));
                data
            }
            Self::UserJoined {
                room_id,
                user_count,
            } => {
                let mut data = Payload::new();
                data.insert("room_id".into(), Value::String(room_id));
                data.insert("user_count".into(), Value::from(user_count));
                data
            }
            Self::UserLeft {
                room_id,
                user_id,
                user_count,
            } => {
                let mut data = Payload::new();
                data.insert("room_id".into(), Value::String(room_id));
                data.insert("user_id".into(), Value::String(user_id));
                data.insert("user_count".into(), Value::from(user_count));
                data
            }
            Self::Error { message } => {
                let mut data = Payload::new();
                data.insert("message".into(), Value::String(message));
                data
            }
            Self::CodeUpdate(data) | Self::CursorPosition(data) | Self::CursorUpdate(data) => data,
        };
        Envelope::now(kind, data)
    }

    /// Encode once into shared text, ready to be cloned into many outboxes.
    pub fn encode(self) -> Result<Arc<str>, ProtocolError> {
        self.into_envelope().encode().map(Arc::from)
    }
}
