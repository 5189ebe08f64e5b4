// src/rabbitmq/message.rs
// Outbound payloads, transport metadata and the retry annotator

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::errors::Result;

pub const DEFAULT_PRIORITY: u8 = 5;
pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const ATTEMPTS_FIELD: &str = "attempts";

/// What a caller hands to `send`.
///
/// Raw bytes and text go out untouched. A `Record` is stamped with an
/// attempt counter and serialized as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Record(Value),
}

impl Payload {
    /// Build a structured payload from any serializable value.
    pub fn record<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Record(serde_json::to_value(value)?))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Record(value)
    }
}

/// Caller-supplied transport options. Everything here is passed through to
/// the broker as-is, except `priority` which falls back to 5.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub priority: Option<u8>,
    pub persistent: bool,
    pub expiration: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Only honoured for raw payloads; records are always JSON.
    pub content_type: Option<String>,
}

impl SendOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Metadata attached to every published message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageProperties {
    pub message_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub priority: u8,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub expiration: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// A fully prepared message: serialized body plus transport metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    /// Prepare a payload for publishing, stamping a fresh message id and the
    /// current time.
    pub fn build(payload: Payload, options: SendOptions) -> Result<Self> {
        let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
        Self::build_at(payload, options, timestamp)
    }

    pub(crate) fn build_at(payload: Payload, options: SendOptions, timestamp: u64) -> Result<Self> {
        let SendOptions {
            priority,
            persistent,
            expiration,
            correlation_id,
            reply_to,
            content_type,
        } = options;

        let (body, content_type) = match payload {
            Payload::Bytes(bytes) => (bytes, content_type),
            Payload::Text(text) => (text.into_bytes(), content_type),
            Payload::Record(mut record) => {
                annotate_attempts(&mut record);
                (serde_json::to_vec(&record)?, Some(JSON_CONTENT_TYPE.to_string()))
            }
        };

        Ok(Self {
            body,
            properties: MessageProperties {
                message_id: Uuid::new_v4().to_string(),
                timestamp,
                priority: priority.unwrap_or(DEFAULT_PRIORITY),
                content_type,
                persistent,
                expiration,
                correlation_id,
                reply_to,
            },
        })
    }
}

/// Stamp a record with its attempt counter: 0 on first send, +1 on every
/// resend of a record that already carries one.
///
/// Only JSON objects carry the counter; other values are left alone. A
/// counter that is not a non-negative integer is restarted at 0.
pub fn annotate_attempts(record: &mut Value) {
    let Value::Object(fields) = record else {
        return;
    };

    let next = match fields.get(ATTEMPTS_FIELD).and_then(Value::as_u64) {
        Some(previous) => previous.saturating_add(1),
        None => 0,
    };
    fields.insert(ATTEMPTS_FIELD.to_string(), Value::from(next));
}

/// Read the attempt counter back off a record.
pub fn attempts(record: &Value) -> Option<u64> {
    record.get(ATTEMPTS_FIELD).and_then(Value::as_u64)
}
