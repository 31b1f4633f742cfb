//! # focus-transport
//!
//! Transport abstraction layer for the focus realtime hub.
//!
//! - **WebSocket** - axum upgraded sockets (feature `websocket`, default)
//! - **Memory** - channel-backed peers for tests (feature `memory`)
//!
//! ## Transport Abstraction
//!
//! A connection is split into a [`ConnectionSink`] that the registry and
//! delivery engine share, and a [`ConnectionStream`] owned by the
//! connection's read loop.
//!
//! ```rust,ignore
//! use focus_transport::{websocket, ConnectionStream};
//!
//! async fn handle(socket: axum::extract::ws::WebSocket) {
//!     let (sink, mut stream) = websocket::split(socket, None);
//!     while let Ok(Some(frame)) = stream.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "memory")]
pub mod memory;

pub use traits::{
    close_within, send_within, ConnectionId, ConnectionSink, ConnectionStream, Inbound, Outbound,
    TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketReader, WebSocketSink};
