//! Transport abstraction traits for the focus hub.
//!
//! A live connection is split into a shareable write half
//! ([`ConnectionSink`]) and an exclusively owned read half
//! ([`ConnectionStream`]). The registry and delivery engine only ever see
//! the sink; the read half stays with the connection's lifecycle task.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Unique identifier for a connection (server-generated).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A frame written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded JSON text frame, shared across broadcast recipients.
    Text(Arc<str>),
    /// Transport-level liveness probe.
    Ping,
}

impl Outbound {
    /// Create a text frame.
    #[must_use]
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Outbound::Text(text.into())
    }
}

/// A frame read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Transport-level ping from the peer.
    Ping,
    /// Transport-level pong answering a liveness probe.
    Pong,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation did not complete within its deadline.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The write half of a connection.
///
/// Implementations serialize concurrent writers internally, so a sink can
/// be shared between the lifecycle task (heartbeat replies) and the
/// delivery engine (events, liveness probes).
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Write a frame to the connection.
    async fn send(&self, frame: Outbound) -> Result<(), TransportError>;

    /// Close the connection. Closing an already closed sink is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the connection is still open for writing.
    fn is_open(&self) -> bool;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// The read half of a connection.
#[async_trait]
pub trait ConnectionStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// Write a frame, giving up after `limit`.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] if the write did not finish in time,
/// or the sink's own error.
pub async fn send_within(
    sink: &dyn ConnectionSink,
    frame: Outbound,
    limit: Duration,
) -> Result<(), TransportError> {
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Close a sink, giving up after `limit`.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] if the close handshake stalled.
pub async fn close_within(sink: &dyn ConnectionSink, limit: Duration) -> Result<(), TransportError> {
    match tokio::time::timeout(limit, sink.close()).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverSink;

    #[async_trait]
    impl ConnectionSink for NeverSink {
        async fn send(&self, _frame: Outbound) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_within_times_out() {
        let result = send_within(&NeverSink, Outbound::Ping, Duration::from_secs(10)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
