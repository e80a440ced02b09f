//! Message envelopes carried inside frames.
//!
//! Inbound documents look like `{"id"?: string, "type": string, "body"?: object}`.
//! Outbound documents are either a reply
//! `{"id"?: string, "client_id": string, "type": string, "data"?: any}`
//! or an error `{"client_id": string, "type": "ERROR", "message": string}`.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use super::Command;
use crate::error::{ProtocolFault, Result};

/// Identity stamped on server-originated messages.
pub const SERVER_IDENTITY: &str = "server";

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Opaque echo token (empty when the client sent none).
    pub id: String,
    /// Recognized inbound command.
    pub command: Command,
    /// Untyped payload for the domain service (empty object when absent).
    pub body: Value,
}

impl Inbound {
    /// Parse and validate a decoded frame body.
    ///
    /// Accepts `data` as an alias for `body`. A non-string `id` is ignored.
    pub fn parse(payload: &[u8]) -> std::result::Result<Self, ProtocolFault> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolFault::Malformed(e.to_string()))?;

        let Value::Object(mut fields) = value else {
            return Err(ProtocolFault::Malformed("document is not an object".into()));
        };

        let kind = match fields.get("type") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(ProtocolFault::MissingType),
        };

        let command = match Command::from_wire(&kind) {
            Command::Unrecognized => return Err(ProtocolFault::Unrecognized(kind)),
            Command::Error => return Err(ProtocolFault::SendOnly(kind)),
            command => command,
        };

        let id = match fields.remove("id") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };

        let body = fields
            .remove("body")
            .or_else(|| fields.remove("data"))
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Self { id, command, body })
    }
}

/// Successful reply or server notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub client_id: String,
    #[serde(rename = "type")]
    pub command: Command,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Error notice sent once a client identity is known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub client_id: String,
    #[serde(rename = "type")]
    pub command: Command,
    pub message: String,
}

/// Any document the server writes to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Reply(Reply),
    Error(ErrorReply),
}

impl Outbound {
    /// Heartbeat echo: `{"id", "client_id", "type": "PING"}`.
    pub fn heartbeat(id: &str, client_id: &str) -> Self {
        Outbound::Reply(Reply {
            id: Some(id.to_string()),
            client_id: client_id.to_string(),
            command: Command::Heartbeat,
            data: None,
        })
    }

    /// Reply carrying a payload for `command`.
    pub fn reply(id: &str, client_id: &str, command: Command, data: Value) -> Self {
        Outbound::Reply(Reply {
            id: Some(id.to_string()),
            client_id: client_id.to_string(),
            command,
            data: Some(data),
        })
    }

    /// `ERROR` notice with a fixed human-readable message.
    pub fn error(client_id: &str, message: &str) -> Self {
        Outbound::Error(ErrorReply {
            client_id: client_id.to_string(),
            command: Command::Error,
            message: message.to_string(),
        })
    }

    /// Server-originated `GET` notification fanned out to every client.
    pub fn broadcast(data: Value) -> Self {
        Outbound::Reply(Reply {
            id: None,
            client_id: SERVER_IDENTITY.to_string(),
            command: Command::Query,
            data: Some(data),
        })
    }

    /// Command carried in the `type` field.
    pub fn command(&self) -> Command {
        match self {
            Outbound::Reply(r) => r.command,
            Outbound::Error(e) => e.command,
        }
    }

    /// Serialize to compact JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
