//! Envelope types for the focus protocol.
//!
//! Envelopes are the fundamental unit of communication on a hub socket.
//! Each one is a JSON text frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name of a client heartbeat request.
pub const PING_EVENT: &str = "ping";

/// Event name of the server heartbeat response.
pub const PONG_EVENT: &str = "pong";

/// Encoded heartbeat response, identical to `encode(&Envelope::pong())`.
pub const PONG_FRAME: &str = r#"{"event":"pong","data":{}}"#;

/// A server-to-client event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `"tick"` or `"session:updated"`.
    pub event: String,
    /// Event payload. Always present on the wire, `{}` when empty.
    #[serde(default = "empty_object")]
    pub data: Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Create the heartbeat response envelope.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(PONG_EVENT, empty_object())
    }
}

/// A client-to-server frame.
///
/// Parsing is lenient: any JSON object is accepted, and frames without an
/// `event` string are simply unrecognized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Event name, if the client sent one as a string.
    #[serde(default, deserialize_with = "string_or_none")]
    pub event: Option<String>,
    /// Optional payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ClientMessage {
    /// Create a client message with the given event name.
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: None,
        }
    }

    /// Whether this frame is a heartbeat request.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.event.as_deref() == Some(PING_EVENT)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

// `{"event": 42}` is a valid object with an unrecognized event, not a parse error.
fn string_or_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}
