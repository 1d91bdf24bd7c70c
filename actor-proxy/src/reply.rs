//! The value returned by a successful command

use std::ops::Deref;

use serde_json::Value;

use crate::error::Result;
use crate::flatten::flatten;
use crate::types::{CommandReply, Payload};
use crate::unpack::{UnpackOptions, Unpacked, unpack, unpack_with};

/// Payload of a successful reply, tagged with the actor that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    actor: String,
    payload: Payload,
}

impl Reply {
    pub fn new(actor: impl Into<String>, payload: Payload) -> Self {
        Self {
            actor: actor.into(),
            payload,
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Extract fields by key or glob pattern.
    pub fn unpack(&self, keys: &[&str]) -> Unpacked {
        unpack(self, keys)
    }

    pub fn unpack_with(&self, keys: &[&str], options: UnpackOptions) -> Result<Unpacked> {
        unpack_with(self, keys, options)
    }

    /// Same reply with nested mappings collapsed into dotted keys.
    pub fn flatten(&self) -> Reply {
        Reply::new(self.actor.clone(), flatten(&self.payload))
    }
}

impl Deref for Reply {
    type Target = Payload;

    fn deref(&self) -> &Payload {
        &self.payload
    }
}

impl From<CommandReply> for Reply {
    fn from(reply: CommandReply) -> Self {
        Reply::new(reply.origin, reply.message)
    }
}

impl From<Reply> for Value {
    fn from(reply: Reply) -> Self {
        Value::Object(reply.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_views() {
        let payload = json!({"status": {"ra": 1.5, "dec": 2.0}, "mode": "track"});
        let reply = Reply::new("telescope", payload.as_object().cloned().unwrap());

        assert_eq!(reply.actor(), "telescope");
        assert_eq!(reply["mode"], "track");
        assert_eq!(reply.len(), 2);

        let flat = reply.flatten();
        assert_eq!(flat.unpack(&["status.*"]).into_vec(), vec![json!(1.5), json!(2.0)]);
        assert_eq!(flat.unpack(&["mode"]), Unpacked::Scalar(json!("track")));
        assert_eq!(Value::from(reply), payload);
    }
}
