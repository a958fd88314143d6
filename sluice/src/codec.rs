//! Codecs and the decoding filter.
//!
//! `DecodingFilter` is the stock filter stage for log ingestion: it picks a
//! codec by the raw message's codec name, decodes, drops incomplete results
//! and stamps provenance fields onto what is left. `MultiDecodingFilter` does
//! the same for codecs that turn one payload into several messages.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProcessingError;
use crate::handler::Filter;
use crate::message::{
    Message, RawMessage, FIELD_MESSAGE, FIELD_REMOTE_IP, FIELD_REMOTE_PORT, FIELD_SOURCE_INPUT,
    UNKNOWN_SOURCE,
};

pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means the payload carried nothing worth keeping.
    fn decode(&self, raw: &RawMessage) -> Result<Option<Message>, ProcessingError>;

    /// Decode a payload that may carry several messages, in payload order.
    /// Single-message codecs keep the default.
    fn decode_many(&self, raw: &RawMessage) -> Result<Vec<Message>, ProcessingError> {
        Ok(self.decode(raw)?.into_iter().collect())
    }

    /// Source that replaces whatever the payload or the remote address said.
    fn override_source(&self) -> Option<&str> {
        None
    }
}

#[derive(Default, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `raw` codec.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(RawCodec::new());
        registry
    }

    /// Add a codec under its own name, replacing any previous one.
    pub fn register<C: Codec + 'static>(&mut self, codec: C) -> &mut Self {
        self.codecs.insert(codec.name().to_string(), Arc::new(codec));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(name)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

/// Payload as lossy UTF-8 text. Leaves the source empty so the filter can
/// fill it in from the remote address.
#[derive(Debug, Default, Clone)]
pub struct RawCodec {
    override_source: Option<String>,
}

impl RawCodec {
    pub const NAME: &'static str = "raw";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override_source(mut self, source: impl Into<String>) -> Self {
        self.override_source = Some(source.into());
        self
    }
}

impl Codec for RawCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn decode(&self, raw: &RawMessage) -> Result<Option<Message>, ProcessingError> {
        let text = String::from_utf8_lossy(&raw.payload);
        let text = text.trim_end_matches(['\r', '\n']);
        let mut message = Message::new(raw.id, "", text);
        message.timestamp = raw.received_at;
        Ok(Some(message))
    }

    fn override_source(&self) -> Option<&str> {
        self.override_source.as_deref()
    }
}

pub struct DecodingFilter {
    registry: Arc<CodecRegistry>,
}

impl DecodingFilter {
    pub fn new(registry: CodecRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl Filter<RawMessage, Message> for DecodingFilter {
    fn filter(&self, raw: RawMessage) -> Result<Option<Message>, ProcessingError> {
        let Some(codec) = lookup(&self.registry, &raw) else {
            return Ok(None);
        };

        let decoded = codec.decode(&raw).map_err(|e| codec_error(&**codec, e))?;
        let Some(mut message) = decoded else {
            trace_debug!(codec = %raw.codec, id = raw.id, "codec produced no message");
            return Ok(None);
        };
        if !is_kept(&message) {
            return Ok(None);
        }

        stamp(&raw, &**codec, &mut message);
        Ok(Some(message))
    }
}

/// Filter stage for payloads that hold several messages (chunked or
/// line-delimited transports). Emits the decoded batch, or nothing when no
/// message in it is complete.
pub struct MultiDecodingFilter {
    registry: Arc<CodecRegistry>,
}

impl MultiDecodingFilter {
    pub fn new(registry: CodecRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl Filter<RawMessage, Vec<Message>> for MultiDecodingFilter {
    fn filter(&self, raw: RawMessage) -> Result<Option<Vec<Message>>, ProcessingError> {
        let Some(codec) = lookup(&self.registry, &raw) else {
            return Ok(None);
        };

        let mut messages = codec
            .decode_many(&raw)
            .map_err(|e| codec_error(&**codec, e))?;
        messages.retain(is_kept);
        if messages.is_empty() {
            trace_debug!(codec = %raw.codec, id = raw.id, "codec produced no message");
            return Ok(None);
        }

        for message in &mut messages {
            stamp(&raw, &**codec, message);
        }
        Ok(Some(messages))
    }
}

fn lookup<'a>(registry: &'a CodecRegistry, raw: &RawMessage) -> Option<&'a Arc<dyn Codec>> {
    let codec = registry.get(&raw.codec);
    if codec.is_none() {
        trace_warn!(codec = %raw.codec, id = raw.id, "no codec registered, skipping message");
    }
    codec
}

fn codec_error(codec: &dyn Codec, error: ProcessingError) -> ProcessingError {
    ProcessingError::new(format!("{} codec: {}", codec.name(), error))
}

fn is_kept(message: &Message) -> bool {
    if message.is_complete() {
        return true;
    }
    trace_debug!(
        id = message.id,
        fields = ?message.fields.keys().collect::<Vec<_>>(),
        "dropping incomplete message, missing {}",
        FIELD_MESSAGE
    );
    false
}

fn stamp(raw: &RawMessage, codec: &dyn Codec, message: &mut Message) {
    if let Some(input) = &raw.source_input {
        message.set_field(FIELD_SOURCE_INPUT, input.clone());
    }

    if let Some(addr) = raw.remote_addr {
        let ip = addr.ip().to_string();
        if addr.port() > 0 {
            message.set_field(FIELD_REMOTE_PORT, addr.port());
        }
        if message.source.is_empty() {
            message.source = ip.clone();
        }
        message.set_field(FIELD_REMOTE_IP, ip);
    }

    if let Some(source) = codec.override_source().filter(|s| !s.is_empty()) {
        message.source = source.to_string();
    }
    if message.source.is_empty() {
        message.source = UNKNOWN_SOURCE.to_string();
    }

    message.received_at = raw.received_at;
}
