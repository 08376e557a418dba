// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! `MessageBody` is decided at the publish boundary: a structured value travels
//! as `application/json`, anything else as `text/plain`, and the content type
//! selects the variant again on delivery. An `Envelope` is the parsed view of a
//! delivery that handlers and middleware see.

use crate::errors::PayloadError;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, ShortString};
use serde_json::Value;
use std::time::Duration;

/// Content type for structured (JSON) bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for raw bodies
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Header carrying the number of times a message has been re-published
pub const RETRY_HEADER: &str = "retry";
/// Body field every message must carry
pub const MESSAGE_ID_FIELD: &str = "message_id";

/// A message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Pre-serialized payload, delivered to handlers unchanged.
    Raw(String),
    /// Structured payload, delivered to handlers as canonical JSON.
    Structured(Value),
}

impl MessageBody {
    /// Rebuilds a body from the bytes and content type found on the wire.
    pub fn from_wire(content_type: Option<&str>, data: &[u8]) -> Result<MessageBody, PayloadError> {
        let text = std::str::from_utf8(data).map_err(|_| PayloadError::NotUtf8)?;

        match content_type {
            Some(ct) if is_json(ct) => serde_json::from_str(text)
                .map(MessageBody::Structured)
                .map_err(|err| PayloadError::InvalidJson(err.to_string())),
            _ => Ok(MessageBody::Raw(text.to_owned())),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            MessageBody::Raw(_) => TEXT_CONTENT_TYPE,
            MessageBody::Structured(_) => JSON_CONTENT_TYPE,
        }
    }

    /// The form presented to handlers: structured values are serialized
    /// (object keys sorted), raw strings pass through.
    pub fn normalize(&self) -> String {
        match self {
            MessageBody::Raw(raw) => raw.clone(),
            MessageBody::Structured(value) => value.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.normalize().into_bytes()
    }

    /// Extracts the message identifier. Raw bodies are deserialized first.
    ///
    /// Null, `false`, `0` and empty values count as a missing identifier.
    pub fn message_id(&self) -> Result<String, PayloadError> {
        let parsed;
        let value = match self {
            MessageBody::Structured(value) => value,
            MessageBody::Raw(raw) => {
                parsed = serde_json::from_str::<Value>(raw)
                    .map_err(|err| PayloadError::InvalidJson(err.to_string()))?;
                &parsed
            }
        };

        match value.get(MESSAGE_ID_FIELD) {
            Some(id) if is_truthy(id) => match id {
                Value::String(s) => Ok(s.clone()),
                other => Ok(other.to_string()),
            },
            _ => Err(PayloadError::MissingMessageId),
        }
    }
}

impl From<Value> for MessageBody {
    fn from(value: Value) -> Self {
        MessageBody::Structured(value)
    }
}

impl From<String> for MessageBody {
    fn from(raw: String) -> Self {
        MessageBody::Raw(raw)
    }
}

impl From<&str> for MessageBody {
    fn from(raw: &str) -> Self {
        MessageBody::Raw(raw.to_owned())
    }
}

/// Compares the media type only, ignoring parameters such as `charset`.
fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Parsed view of a delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub body: MessageBody,
    pub headers: FieldTable,
    pub message_id: String,
    pub routing_key: String,
    pub exchange_name: String,
    pub redelivered: bool,
}

impl Envelope {
    /// Current retry count, 0 when the header is absent or unreadable.
    pub fn retry_count(&self) -> u32 {
        retry_count(&self.headers)
    }
}

/// A message as handed to the transport for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: MessageBody,
    pub headers: FieldTable,
    /// Per-message expiration, enforced by the broker.
    pub expiration: Option<Duration>,
}

/// Reads the `retry` header. Integer, floating point, decimal and numeric-string
/// values are accepted; fractions are truncated and negatives read as 0.
pub fn retry_count(headers: &FieldTable) -> u32 {
    let Some(value) = headers.inner().get(RETRY_HEADER) else {
        return 0;
    };

    match value {
        AMQPValue::ShortShortInt(v) => clamp(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => u32::from(*v),
        AMQPValue::ShortInt(v) => clamp(i64::from(*v)),
        AMQPValue::ShortUInt(v) => u32::from(*v),
        AMQPValue::LongInt(v) => clamp(i64::from(*v)),
        AMQPValue::LongUInt(v) => *v,
        AMQPValue::LongLongInt(v) => clamp(*v),
        AMQPValue::Float(v) => truncate(f64::from(*v)),
        AMQPValue::Double(v) => truncate(*v),
        AMQPValue::DecimalValue(v) => {
            truncate(f64::from(v.value) / 10f64.powi(i32::from(v.scale)))
        }
        AMQPValue::ShortString(v) => v.as_str().trim().parse().unwrap_or_default(),
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes())
            .trim()
            .parse()
            .unwrap_or_default(),
        _ => 0,
    }
}

/// Copies `headers`, setting the `retry` header to `retry`.
pub fn with_retry(headers: &FieldTable, retry: u32) -> FieldTable {
    let mut headers = headers.clone();
    headers.insert(
        ShortString::from(RETRY_HEADER),
        AMQPValue::LongLongInt(LongLongInt::from(retry)),
    );
    headers
}

fn clamp(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

// saturating cast: NaN and negatives become 0
fn truncate(v: f64) -> u32 {
    v.max(0.0) as u32
}
