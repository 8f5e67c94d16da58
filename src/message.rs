//! Bus messages.
//!
//! A message is a value object: topic, type, and a JSON data map that
//! carries at least the file `uid`.

use crate::error::{FerryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Data key holding the file identifier.
pub const UID_KEY: &str = "uid";

/// Data key holding the `host:port` of the file owner.
pub const REQUEST_ADDRESS_KEY: &str = "request_address";

/// Data key holding the location of a fetched file.
pub const URI_KEY: &str = "uri";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A file is available and should be requested.
    Push,
    /// A previously requested file has been fetched.
    Ack,
    /// A file is already available, no request needed.
    File,
    /// Liveness heartbeat.
    Beat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Push => "push",
            MessageType::Ack => "ack",
            MessageType::File => "file",
            MessageType::Beat => "beat",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Stamped on receipt when the sender omits it
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Message {
    pub fn new(topic: impl Into<String>, kind: MessageType, data: Map<String, Value>) -> Self {
        Self {
            topic: topic.into(),
            kind,
            time: Utc::now(),
            data,
        }
    }

    /// Convenience constructor for a message whose data is just a uid.
    pub fn with_uid(topic: impl Into<String>, kind: MessageType, uid: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert(UID_KEY.to_string(), Value::String(uid.into()));
        Self::new(topic, kind, data)
    }

    pub fn uid(&self) -> Option<&str> {
        self.data.get(UID_KEY).and_then(Value::as_str)
    }

    pub fn request_address(&self) -> Option<&str> {
        self.data
            .get(REQUEST_ADDRESS_KEY)
            .and_then(Value::as_str)
            .filter(|addr| !addr.is_empty())
    }

    /// Builder-style setter for a single data field.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Derive a reply of another type on the same topic, carrying the same data.
    pub fn reply(&self, kind: MessageType) -> Self {
        Self::new(self.topic.clone(), kind, self.data.clone())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a message.
    ///
    /// Every type except `beat` must carry a string `uid`.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let message: Message = serde_json::from_slice(payload)?;
        if message.kind != MessageType::Beat && message.uid().is_none() {
            return Err(FerryError::MalformedMessage(format!(
                "{} message on {} has no uid",
                message.kind, message.topic
            )));
        }
        Ok(message)
    }
}
