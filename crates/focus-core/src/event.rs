//! Outbound event type.
//!
//! Events are ephemeral: they are encoded once, written to whichever
//! connections match at delivery time, and then forgotten.

use focus_protocol::{codec, Envelope, Identity, ProtocolError};
use serde_json::Value;
use std::sync::Arc;

/// An event waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    /// Event name.
    pub name: String,
    /// Event payload.
    pub payload: Value,
    /// Recipient. `None` addresses every connection.
    pub target: Option<Identity>,
}

impl OutboundEvent {
    /// Create an event for every open connection.
    #[must_use]
    pub fn broadcast(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            target: None,
        }
    }

    /// Create an event for a single identity.
    #[must_use]
    pub fn to(identity: Identity, name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            target: Some(identity),
        }
    }

    /// Whether the event is addressed to a single identity.
    #[must_use]
    pub fn is_targeted(&self) -> bool {
        self.target.is_some()
    }

    /// Encode into the shared wire frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Arc<str>, ProtocolError> {
        let envelope = Envelope::new(self.name.clone(), self.payload.clone());
        codec::encode(&envelope).map(Arc::from)
    }
}
