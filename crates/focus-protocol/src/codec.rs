//! Codec for encoding and decoding focus frames.
//!
//! Frames are JSON text. Outbound envelopes are encoded once and the
//! resulting string is shared across every recipient of a broadcast.

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{ClientMessage, Envelope};

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Frame is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame parsed as JSON but is not an object.
    #[error("Invalid frame: expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Encode an envelope to a JSON text frame.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a client text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, is not JSON, or is not a
/// JSON object.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject(kind_of(&value)));
    }

    Ok(serde_json::from_value(value)?)
}

/// Decode a client binary frame. Binary frames must carry UTF-8 JSON.
///
/// # Errors
///
/// Same as [`decode_client`], plus [`ProtocolError::InvalidUtf8`].
pub fn decode_client_bytes(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode_client(text)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
