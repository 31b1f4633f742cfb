//! # focus-protocol
//!
//! Wire protocol definitions for the focus realtime hub.
//!
//! Every frame on the socket is a small JSON object. Server-to-client
//! frames are [`Envelope`]s of the shape `{"event": string, "data": object}`;
//! client-to-server frames are parsed leniently into [`ClientMessage`].
//!
//! ## Heartbeat
//!
//! A client may send `{"event": "ping"}` at any time and is answered with
//! `{"event": "pong", "data": {}}`.
//!
//! ## Example
//!
//! ```rust
//! use focus_protocol::{codec, Envelope};
//!
//! let frame = Envelope::new("tick", serde_json::json!({}));
//! let text = codec::encode(&frame).unwrap();
//! assert_eq!(text, r#"{"event":"tick","data":{}}"#);
//!
//! let inbound = codec::decode_client(r#"{"event":"ping"}"#).unwrap();
//! assert!(inbound.is_heartbeat());
//! ```

pub mod codec;
pub mod envelope;
pub mod identity;

pub use codec::{decode_client, encode, ProtocolError};
pub use envelope::{ClientMessage, Envelope, PING_EVENT, PONG_EVENT, PONG_FRAME};
pub use identity::Identity;
