//! The RPC envelope: a JSON object tagged with `id` and/or `reply_to`.
//!
//! A [`Message`] is a thin wrapper around a `serde_json::Map` so that
//! arbitrary payload keys pass through untouched while the two reserved
//! envelope keys (`id`, `reply_to`) are addressable without re-parsing the
//! whole object on every read.

use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved key naming a unique request identifier.
pub const KEY_ID: &str = "id";
/// Reserved key echoing the `id` of the request a message answers.
pub const KEY_REPLY_TO: &str = "reply_to";

/// An inbound or outbound RPC frame: a JSON object plus its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    fields: Map<String, Value>,
}

/// The three-way classification of a [`Message`] by envelope shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `id`, no `reply_to`: expects a response.
    Request,
    /// Has `reply_to`, no `id`: answers a prior request.
    Response,
    /// Has neither: fire-and-forget.
    Notification,
}

impl Message {
    /// Wrap a parsed JSON object. Non-object values are coerced into a
    /// single-key `{"value": ...}` map so malformed payloads never panic.
    pub fn from_value(value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self { fields }
    }

    /// Build a fresh request envelope around `payload`, assigning a new
    /// random id. Any `id`/`reply_to` keys already present in `payload` are
    /// overwritten.
    pub fn new_request(payload: Value) -> Self {
        let mut msg = Self::from_value(payload);
        msg.fields
            .insert(KEY_ID.to_string(), Value::String(Uuid::new_v4().to_string()));
        msg.fields.remove(KEY_REPLY_TO);
        msg
    }

    /// Build a response envelope answering `request_id`.
    pub fn new_response(request_id: &str, payload: Value) -> Self {
        let mut msg = Self::from_value(payload);
        msg.fields.remove(KEY_ID);
        msg.fields.insert(
            KEY_REPLY_TO.to_string(),
            Value::String(request_id.to_string()),
        );
        msg
    }

    /// Build a notification envelope: strips any caller-supplied `id` so
    /// the message is unambiguously fire-and-forget, per spec.
    pub fn new_notification(payload: Value) -> Self {
        let mut msg = Self::from_value(payload);
        msg.fields.remove(KEY_ID);
        msg.fields.remove(KEY_REPLY_TO);
        msg
    }

    /// The `id` field, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.fields.get(KEY_ID).and_then(Value::as_str)
    }

    /// The `reply_to` field, if present and a string.
    pub fn reply_to(&self) -> Option<&str> {
        self.fields.get(KEY_REPLY_TO).and_then(Value::as_str)
    }

    /// Classify this message by envelope shape.
    pub fn kind(&self) -> MessageKind {
        match (self.id().is_some(), self.reply_to().is_some()) {
            (true, false) => MessageKind::Request,
            (false, true) => MessageKind::Response,
            _ => MessageKind::Notification,
        }
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume self, returning the underlying JSON object as a `Value`.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Serialize as a single-line JSON string (no trailing newline; callers
    /// append the frame terminator).
    pub fn to_line(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    /// Parse a single line of newline-delimited JSON into a `Message`.
    pub fn parse_line(line: &str) -> crate::error::Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        Ok(Self::from_value(value))
    }
}
