//! In-memory transport.
//!
//! Each [`pair`] yields the server-side sink and stream plus a
//! [`MemoryPeer`] that plays the client. The peer can stall or fail the
//! server's writes and can vanish abruptly by being dropped, which is how
//! tests exercise slow and dead connections without sockets.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{ConnectionSink, ConnectionStream, Inbound, Outbound, TransportError};

const MODE_NORMAL: u8 = 0;
const MODE_STALL: u8 = 1;
const MODE_FAIL: u8 = 2;

struct Shared {
    mode: AtomicU8,
    is_open: AtomicBool,
}

/// Create a connected in-memory sink, stream and client peer.
#[must_use]
pub fn pair() -> (Arc<MemorySink>, MemoryStream, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        mode: AtomicU8::new(MODE_NORMAL),
        is_open: AtomicBool::new(true),
    });

    let sink = Arc::new(MemorySink {
        tx: out_tx,
        shared: shared.clone(),
    });
    let stream = MemoryStream { rx: in_rx };
    let peer = MemoryPeer {
        outbound: out_rx,
        inbound: in_tx,
        shared,
    };
    (sink, stream, peer)
}

/// Server-side write half.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

#[async_trait]
impl ConnectionSink for MemorySink {
    async fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        if !self.shared.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        match self.shared.mode.load(Ordering::SeqCst) {
            MODE_STALL => std::future::pending().await,
            MODE_FAIL => Err(TransportError::SendFailed("simulated write failure".into())),
            _ => self
                .tx
                .send(frame)
                .map_err(|_| TransportError::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.is_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.is_open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// Server-side read half.
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
}

#[async_trait]
impl ConnectionStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The client end of an in-memory connection.
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Send a text frame to the server.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(Ok(Inbound::Text(text.into()))).is_ok()
    }

    /// Send a raw frame to the server.
    pub fn send(&self, frame: Inbound) -> bool {
        self.inbound.send(Ok(frame)).is_ok()
    }

    /// Make the server's next read fail.
    pub fn inject_read_error(&self, reason: impl Into<String>) -> bool {
        self.inbound
            .send(Err(TransportError::ReceiveFailed(reason.into())))
            .is_ok()
    }

    /// Wait for the next frame written by the server.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Take a frame written by the server, if one is ready.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Wait for the next text frame, skipping liveness probes.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.outbound.recv().await? {
                Outbound::Text(text) => return Some(text.to_string()),
                Outbound::Ping => continue,
            }
        }
    }

    /// Make every server write hang until resumed.
    pub fn stall(&self) {
        self.shared.mode.store(MODE_STALL, Ordering::SeqCst);
    }

    /// Make every server write fail until resumed.
    pub fn fail_writes(&self) {
        self.shared.mode.store(MODE_FAIL, Ordering::SeqCst);
    }

    /// Restore normal write behaviour.
    pub fn resume(&self) {
        self.shared.mode.store(MODE_NORMAL, Ordering::SeqCst);
    }

    /// Whether the server has closed its side.
    #[must_use]
    pub fn is_closed_by_server(&self) -> bool {
        !self.shared.is_open.load(Ordering::SeqCst)
    }
}
