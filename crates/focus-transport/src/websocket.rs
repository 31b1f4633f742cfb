//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`ConnectionSink`] /
//! [`ConnectionStream`] pair.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::traits::{ConnectionSink, ConnectionStream, Inbound, Outbound, TransportError};

/// Split an upgraded socket into its shareable write half and owned read half.
pub fn split(
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
) -> (Arc<WebSocketSink>, WebSocketReader) {
    let (sender, receiver) = socket.split();
    let sink = Arc::new(WebSocketSink {
        inner: Mutex::new(sender),
        is_open: AtomicBool::new(true),
        remote_addr,
    });
    (sink, WebSocketReader { inner: receiver })
}

/// Write half of a WebSocket connection.
pub struct WebSocketSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
    is_open: AtomicBool,
    remote_addr: Option<SocketAddr>,
}

#[async_trait]
impl ConnectionSink for WebSocketSink {
    async fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Outbound::Text(text) => Message::Text(text.to_string()),
            Outbound::Ping => Message::Ping(Vec::new()),
        };

        let mut sender = self.inner.lock().await;
        sender.send(message).await.map_err(|e| {
            self.is_open.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut sender = self.inner.lock().await;
        sender
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// Read half of a WebSocket connection.
pub struct WebSocketReader {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl ConnectionStream for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.inner.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Inbound::Text(text))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Inbound::Binary(data))),
            // axum answers pings itself; surfacing them still counts as activity.
            Some(Ok(Message::Ping(_))) => {
                trace!("Received ping");
                Ok(Some(Inbound::Ping))
            }
            Some(Ok(Message::Pong(_))) => Ok(Some(Inbound::Pong)),
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Received close frame");
                Ok(None)
            }
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}
