//! Shared wire types for the actor message bus
//!
//! Every line exchanged through the bus daemon is one JSON-encoded
//! [`BusMessage`]. Commands and their replies share the same `id`, which is
//! how the dispatch actor correlates them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::ERROR_KEY;

/// A reply payload: a JSON object with unique string keys, kept in insertion order.
pub type Payload = serde_json::Map<String, Value>;

/// Trait for bus payloads that can be wrapped into a [`BusMessage`]
pub trait BusPayload: Serialize + serde::de::DeserializeOwned + Clone + Send + 'static {
    /// Get the message type for this payload
    fn message_type(&self) -> BusMessageType;
}

/// Envelope for everything sent over the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    /// Unique id; replies reuse the id of the command they answer
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: BusMessageType,

    /// Name of the connection that sent the message
    pub sender: String,

    pub payload: Value,
}

impl BusMessage {
    pub fn new<P: BusPayload>(id: String, sender: String, payload: &P) -> serde_json::Result<Self> {
        Ok(Self {
            id,
            message_type: payload.message_type(),
            sender,
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusMessageType {
    Command,
    Reply,
}

/// A command addressed to one actor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandPayload {
    /// Target actor
    pub actor: String,

    /// Command name followed by the encoded argument tokens
    pub command_line: String,
}

impl BusPayload for CommandPayload {
    fn message_type(&self) -> BusMessageType {
        BusMessageType::Command
    }
}

/// One reply to a command. Actors may send any number of `running`
/// replies before the final `done` or `failed` one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyPayload {
    /// Actor that produced the reply
    pub actor: String,

    pub status: CommandStatus,

    #[serde(default)]
    pub message: Payload,
}

impl BusPayload for ReplyPayload {
    fn message_type(&self) -> BusMessageType {
        BusMessageType::Reply
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Running,
    Done,
    Failed,
}

impl CommandStatus {
    /// Whether this status ends the command
    pub fn is_done(self) -> bool {
        matches!(self, CommandStatus::Done | CommandStatus::Failed)
    }

    pub fn did_fail(self) -> bool {
        self == CommandStatus::Failed
    }
}

/// A reply as seen by a callback: intermediate or final.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEvent {
    pub sender: String,
    pub status: CommandStatus,
    pub message: Payload,
}

/// The decoded final reply of one command invocation.
///
/// On success `message` is the payload. On failure `message` carries the
/// error description under the `error` field.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    /// Actor that produced the reply
    pub origin: String,
    pub succeeded: bool,
    pub message: Payload,
}

impl CommandReply {
    pub fn success(origin: impl Into<String>, payload: Payload) -> Self {
        Self {
            origin: origin.into(),
            succeeded: true,
            message: payload,
        }
    }

    pub fn failure(origin: impl Into<String>, error: Value) -> Self {
        let mut message = Payload::new();
        message.insert(ERROR_KEY.to_string(), error);
        Self {
            origin: origin.into(),
            succeeded: false,
            message,
        }
    }

    /// Payload of a successful reply
    pub fn payload(&self) -> Option<&Payload> {
        self.succeeded.then_some(&self.message)
    }

    /// Raw `error` field of a failed reply
    pub fn error(&self) -> Option<&Value> {
        if self.succeeded {
            None
        } else {
            self.message.get(ERROR_KEY)
        }
    }

    pub fn status(&self) -> CommandStatus {
        if self.succeeded {
            CommandStatus::Done
        } else {
            CommandStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bus_message_wire_format() {
        let payload = CommandPayload {
            actor: "proto".to_string(),
            command_line: "ping".to_string(),
        };
        let message = BusMessage::new("id-1".to_string(), "client".to_string(), &payload).unwrap();

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "id": "id-1",
                "type": "command",
                "sender": "client",
                "payload": {"actor": "proto", "command_line": "ping"}
            })
        );
    }

    #[test]
    fn test_reply_payload_defaults_message() {
        let reply: ReplyPayload =
            serde_json::from_value(json!({"actor": "proto", "status": "running"})).unwrap();
        assert!(reply.message.is_empty());
        assert!(!reply.status.is_done());
    }

    #[test]
    fn test_command_reply_accessors() {
        let ok = CommandReply::success("proto", json!({"text": "Pong."}).as_object().unwrap().clone());
        assert_eq!(ok.payload().unwrap()["text"], "Pong.");
        assert!(ok.error().is_none());
        assert_eq!(ok.status(), CommandStatus::Done);

        let failed = CommandReply::failure("proto", json!("boom"));
        assert!(failed.payload().is_none());
        assert_eq!(failed.error(), Some(&json!("boom")));
        assert!(failed.status().did_fail());
    }
}
