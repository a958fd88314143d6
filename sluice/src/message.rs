//! Log message model.
//!
//! `RawMessage` is what a protocol adapter publishes: undecoded bytes plus
//! where they came from. `Message` is what the decoding filter produces and
//! the output sink receives.

use std::net::SocketAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-text body. A message without it is incomplete.
pub const FIELD_MESSAGE: &str = "message";
/// Id of the input that received the message.
pub const FIELD_SOURCE_INPUT: &str = "source_input";
pub const FIELD_REMOTE_IP: &str = "remote_ip";
pub const FIELD_REMOTE_PORT: &str = "remote_port";

/// Fallback when neither the codec nor the remote address name a source.
pub const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: u64,
    /// Name of the codec that can decode `payload`.
    pub codec: String,
    pub payload: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
    pub source_input: Option<String>,
    pub received_at: SystemTime,
}

impl RawMessage {
    pub fn new(id: u64, codec: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            codec: codec.into(),
            payload: payload.into(),
            remote_addr: None,
            source_input: None,
            received_at: SystemTime::now(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_source_input(mut self, input: impl Into<String>) -> Self {
        self.source_input = Some(input.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub source: String,
    pub timestamp: SystemTime,
    /// When the raw message reached the adapter.
    pub received_at: SystemTime,
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(id: u64, source: impl Into<String>, text: impl Into<String>) -> Self {
        let now = SystemTime::now();
        let mut fields = Map::new();
        fields.insert(FIELD_MESSAGE.to_string(), Value::String(text.into()));
        Self {
            id,
            source: source.into(),
            timestamp: now,
            received_at: now,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn text(&self) -> Option<&str> {
        self.field(FIELD_MESSAGE).and_then(Value::as_str)
    }

    /// Has a non-empty `message` field.
    pub fn is_complete(&self) -> bool {
        match self.field(FIELD_MESSAGE) {
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }
}
