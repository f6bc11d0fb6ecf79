//! Newline-delimited JSON wire protocol.
//!
//! Every record is one JSON object on its own line, tagged by a camelCase
//! `type` field:
//!
//! ```text
//! → {"type":"authenticate","userId":1,"username":"alice"}
//! ← {"type":"authenticated","userId":1,"username":"alice"}
//! → {"type":"sendMessage","content":"hi","messageId":"m1"}
//! ← {"type":"response","content":"Hello!","messageId":"m1"}
//! ```
//!
//! Decoding distinguishes two failures: a record whose `type` is missing or
//! not one we know ([`ProtocolError::UnknownType`]), and anything else that
//! does not decode ([`ProtocolError::InvalidFormat`]). Both are answered
//! with an `error` record and leave the connection open.

use broker_application::ports::backend::BackendState;
use broker_domain::WireId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client → server record kinds.
const CLIENT_TYPES: &[&str] = &["authenticate", "sendMessage", "clearContext", "getStatus"];

/// Errors decoding a client record. The `Display` text is sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type")]
    UnknownType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Authenticate {
        user_id: WireId,
        username: String,
    },
    SendMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<WireId>,
    },
    ClearContext,
    GetStatus,
}

/// Static description of the broker sent on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub backend: String,
    pub context_size: usize,
    pub max_tokens: usize,
}

/// Answer to `getStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: bool,
    pub active_sessions: usize,
    pub queue_length: usize,
    /// Owner label of the request the backend is serving, if any.
    pub in_flight_owner: Option<String>,
    pub turn_count: usize,
    pub context_tokens: usize,
    pub context_budget: usize,
    pub backend_state: BackendState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Connected {
        message: String,
        server_info: ServerInfo,
    },
    Authenticated {
        user_id: WireId,
        username: String,
    },
    Response {
        content: String,
        #[serde(default)]
        message_id: Option<WireId>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<WireId>,
    },
    ContextCleared,
    Status(StatusReport),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, message_id: Option<WireId>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            message_id,
        }
    }
}

/// Decode one line received from a client.
pub fn decode(line: &str) -> Result<ClientMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|_| ProtocolError::InvalidFormat)?;
    let Some(record) = value.as_object() else {
        return Err(ProtocolError::InvalidFormat);
    };

    match record.get("type").and_then(serde_json::Value::as_str) {
        Some(kind) if CLIENT_TYPES.contains(&kind) => {
            serde_json::from_value(value).map_err(|_| ProtocolError::InvalidFormat)
        }
        _ => Err(ProtocolError::UnknownType),
    }
}

/// Encode a record as one newline-terminated line.
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
