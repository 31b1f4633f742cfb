//! Connection lifecycle.
//!
//! ```text
//! Connecting ──▶ Authenticated ──▶ Open ──▶ Closing ──▶ Closed
//!      │               │                                  ▲
//!      └───────────────┴──────────────────────────────────┘
//! ```
//!
//! A [`PendingConnection`] only becomes an [`AuthenticatedConnection`] by
//! passing the session gate's verdict through
//! [`PendingConnection::authenticate`], so an unauthenticated transport can
//! never reach the registry. [`ConnectionLifecycle::run`] then owns the
//! connection until it is closed.

use focus_protocol::{codec, ClientMessage, Identity, ProtocolError, PONG_FRAME};
use focus_transport::{
    close_within, send_within, ConnectionId, ConnectionSink, ConnectionStream, Inbound, Outbound,
    TransportError,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::registry::{ConnectionEntry, ConnectionRegistry, RegistryError};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade requested; credential not yet checked.
    Connecting,
    /// Credential accepted; not yet registered.
    Authenticated,
    /// Registered and reading.
    Open,
    /// Tearing down.
    Closing,
    /// Gone.
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of this state.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Authenticated, Closed, Closing, Connecting, Open};
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Open)
                | (Authenticated, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }

    fn advance(&mut self, next: ConnectionState, id: &ConnectionId) {
        debug_assert!(
            self.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self,
            next
        );
        trace!(connection = %id, from = %self, to = %next, "State transition");
        *self = next;
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why an open connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport.
    RemoteClosed,
    /// Reading from the transport failed.
    ReadError,
    /// Nothing was read within the read deadline.
    ReadTimeout,
    /// A heartbeat reply could not be written.
    WriteFailed,
    /// The delivery engine removed the entry after a failed write.
    Evicted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::RemoteClosed => "remote_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::ReadTimeout => "read_timeout",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Evicted => "evicted",
        };
        f.write_str(name)
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Rolling read deadline, reset by every successful read.
    pub read_timeout: Duration,
    /// Deadline for heartbeat replies and the final close.
    pub write_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// A connection whose credential has not been checked yet.
#[derive(Debug)]
pub struct PendingConnection {
    id: ConnectionId,
    state: ConnectionState,
}

impl PendingConnection {
    #[must_use]
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
        }
    }

    /// Create a pending connection with a freshly generated handle.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(ConnectionId::generate())
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply the session gate's verdict.
    ///
    /// # Errors
    ///
    /// Hands back the gate's error; the connection is then closed and was
    /// never opened.
    pub fn authenticate<E: fmt::Display>(
        mut self,
        verdict: Result<Identity, E>,
    ) -> Result<AuthenticatedConnection, E> {
        match verdict {
            Ok(identity) => {
                self.state.advance(ConnectionState::Authenticated, &self.id);
                debug!(connection = %self.id, identity = %identity, "Connection authenticated");
                Ok(AuthenticatedConnection {
                    id: self.id,
                    identity,
                })
            }
            Err(e) => {
                self.state.advance(ConnectionState::Closed, &self.id);
                warn!(connection = %self.id, error = %e, "Connection rejected");
                Err(e)
            }
        }
    }
}

/// A connection that passed the session gate.
#[derive(Debug, Clone)]
pub struct AuthenticatedConnection {
    id: ConnectionId,
    identity: Identity,
}

impl AuthenticatedConnection {
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// What happened over the life of one open connection.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub identity: Identity,
    pub reason: CloseReason,
    /// Frames read from the peer, malformed ones included.
    pub frames_received: u64,
    /// Heartbeat replies written.
    pub heartbeats: u64,
    pub duration: Duration,
    /// Time since the last frame was read, measured at teardown.
    pub idle: Duration,
    pub state: ConnectionState,
}

/// Runs open connections against a shared registry.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    registry: Arc<ConnectionRegistry>,
    config: LifecycleConfig,
}

impl ConnectionLifecycle {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, config: LifecycleConfig) -> Self {
        Self { registry, config }
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Register the connection and read from it until it ends.
    ///
    /// Teardown removes the entry and releases the transport on every exit
    /// path, including when the delivery engine already removed it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateConnection`] if the handle is
    /// already registered; the transport is released and nothing is read.
    pub async fn run<S>(
        &self,
        conn: AuthenticatedConnection,
        sink: Arc<dyn ConnectionSink>,
        mut stream: S,
    ) -> Result<ConnectionSummary, RegistryError>
    where
        S: ConnectionStream,
    {
        let mut state = ConnectionState::Authenticated;
        let entry = match self
            .registry
            .add(conn.id.clone(), conn.identity.clone(), sink.clone())
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(connection = %conn.id, error = %e, "Registration failed");
                state.advance(ConnectionState::Closed, &conn.id);
                self.release(&conn.id, sink.as_ref()).await;
                return Err(e);
            }
        };
        state.advance(ConnectionState::Open, &conn.id);

        info!(
            connection = %conn.id,
            identity = %conn.identity,
            remote = sink.remote_addr().as_deref().unwrap_or("unknown"),
            "Connection opened"
        );

        let started = Instant::now();
        let mut frames_received = 0u64;
        let mut heartbeats = 0u64;

        let reason = loop {
            let read = tokio::select! {
                biased;
                () = entry.evicted() => break CloseReason::Evicted,
                read = tokio::time::timeout(self.config.read_timeout, stream.recv()) => read,
            };

            let frame = match read {
                Err(_) => break CloseReason::ReadTimeout,
                Ok(Err(e)) => {
                    debug!(connection = %conn.id, error = %e, "Read failed");
                    break CloseReason::ReadError;
                }
                Ok(Ok(None)) => break CloseReason::RemoteClosed,
                Ok(Ok(Some(frame))) => frame,
            };

            entry.touch();
            frames_received += 1;

            match self.handle_frame(&entry, frame).await {
                Ok(true) => heartbeats += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(connection = %conn.id, error = %e, "Heartbeat reply failed");
                    break CloseReason::WriteFailed;
                }
            }
        };

        let idle = entry.idle_for();
        state.advance(ConnectionState::Closing, &conn.id);
        self.registry.remove(&conn.id);
        self.release(&conn.id, sink.as_ref()).await;
        state.advance(ConnectionState::Closed, &conn.id);
        debug_assert!(state.is_terminal());

        let duration = started.elapsed();
        info!(
            connection = %conn.id,
            identity = %conn.identity,
            reason = %reason,
            frames = frames_received,
            duration_ms = duration.as_millis() as u64,
            idle_ms = idle.as_millis() as u64,
            "Connection closed"
        );

        Ok(ConnectionSummary {
            id: conn.id,
            identity: conn.identity,
            reason,
            frames_received,
            heartbeats,
            duration,
            idle,
            state,
        })
    }

    /// Returns whether a heartbeat reply was written.
    async fn handle_frame(
        &self,
        entry: &ConnectionEntry,
        frame: Inbound,
    ) -> Result<bool, TransportError> {
        let parsed = match frame {
            Inbound::Text(text) => codec::decode_client(&text),
            Inbound::Binary(data) => codec::decode_client_bytes(&data),
            // Transport-level control frames only count as activity.
            Inbound::Ping | Inbound::Pong => return Ok(false),
        };

        match parsed {
            Ok(message) if message.is_heartbeat() => {
                send_within(
                    entry.sink().as_ref(),
                    Outbound::text(PONG_FRAME),
                    self.config.write_timeout,
                )
                .await?;
                trace!(connection = %entry.id(), "Answered heartbeat");
                Ok(true)
            }
            Ok(message) => {
                log_ignored(entry, &message);
                Ok(false)
            }
            Err(e) => {
                log_malformed(entry, &e);
                Ok(false)
            }
        }
    }

    async fn release(&self, id: &ConnectionId, sink: &dyn ConnectionSink) {
        if let Err(e) = close_within(sink, self.config.write_timeout).await {
            debug!(connection = %id, error = %e, "Transport close failed");
        }
    }
}

fn log_ignored(entry: &ConnectionEntry, message: &ClientMessage) {
    debug!(
        connection = %entry.id(),
        event = message.event.as_deref().unwrap_or("<none>"),
        "Ignoring client event"
    );
}

fn log_malformed(entry: &ConnectionEntry, error: &ProtocolError) {
    debug!(connection = %entry.id(), error = %error, "Ignoring malformed frame");
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_transport::memory::{self, MemoryPeer, MemorySink, MemoryStream};
    use tokio::task::JoinHandle;

    fn lifecycle(registry: &Arc<ConnectionRegistry>) -> ConnectionLifecycle {
        ConnectionLifecycle::new(registry.clone(), LifecycleConfig::default())
    }

    fn authenticated(id: &str, who: &str) -> AuthenticatedConnection {
        PendingConnection::new(id.into())
            .authenticate::<String>(Ok(Identity::new(who)))
            .unwrap()
    }

    fn open(
        lifecycle: &ConnectionLifecycle,
        id: &str,
        who: &str,
    ) -> (JoinHandle<Result<ConnectionSummary, RegistryError>>, MemoryPeer) {
        let (sink, stream, peer): (Arc<MemorySink>, MemoryStream, MemoryPeer) = memory::pair();
        let lifecycle = lifecycle.clone();
        let conn = authenticated(id, who);
        let task = tokio::spawn(async move { lifecycle.run(conn, sink, stream).await });
        (task, peer)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Authenticated));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Authenticated.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Open));
        assert!(!Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(Closed.is_terminal());
    }

    #[test]
    fn test_rejected_connection_never_opens() {
        let pending = PendingConnection::new("conn-1".into());
        assert_eq!(pending.state(), ConnectionState::Connecting);

        let result = pending.authenticate::<&str>(Err("unauthenticated"));
        assert_eq!(result.unwrap_err(), "unauthenticated");
    }

    #[tokio::test]
    async fn test_heartbeat_answered_and_remote_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (task, mut peer) = open(&lifecycle(&registry), "conn-1", "u1");

        assert!(peer.send_text(r#"{"event":"ping"}"#));
        assert_eq!(peer.recv_text().await.as_deref(), Some(PONG_FRAME));
        assert!(registry.contains(&"conn-1".into()));

        drop(peer);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::RemoteClosed);
        assert_eq!(summary.heartbeats, 1);
        assert_eq!(summary.state, ConnectionState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_ignored() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (task, mut peer) = open(&lifecycle(&registry), "conn-1", "u1");

        peer.send_text("not json");
        peer.send_text("[1,2,3]");
        peer.send_text(r#"{"event":42}"#);
        peer.send_text(r#"{"event":"session:join","data":{"id":"s1"}}"#);
        peer.send(Inbound::Binary(vec![0xff, 0x00]));
        peer.send_text(r#"{"event":"ping","data":{}}"#);

        assert_eq!(peer.recv_text().await.as_deref(), Some(PONG_FRAME));
        assert!(peer.try_recv().is_none());

        peer.send(Inbound::Binary(br#"{"event":"ping"}"#.to_vec()));
        assert_eq!(peer.recv_text().await.as_deref(), Some(PONG_FRAME));

        drop(peer);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.frames_received, 7);
        assert_eq!(summary.heartbeats, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_expires() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (task, peer) = open(&lifecycle(&registry), "conn-1", "u1");

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::ReadTimeout);
        assert!(summary.duration >= Duration::from_secs(60));
        assert!(summary.idle >= Duration::from_secs(60));
        assert!(registry.is_empty());
        assert!(peer.is_closed_by_server());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_reset_deadline() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (task, peer) = open(&lifecycle(&registry), "conn-1", "u1");

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(45)).await;
            peer.send(Inbound::Pong);
        }
        settle().await;
        assert!(registry.contains(&"conn-1".into()));

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::ReadTimeout);
        assert!(summary.duration >= Duration::from_secs(195));
        // Idle time restarts at the last read, not at open.
        assert!(summary.idle >= Duration::from_secs(60));
        assert!(summary.idle < Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_read_error_closes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (task, peer) = open(&lifecycle(&registry), "conn-1", "u1");

        peer.inject_read_error("connection reset");
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::ReadError);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_heartbeat_reply_closes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (task, peer) = open(&lifecycle(&registry), "conn-1", "u1");

        peer.fail_writes();
        peer.send_text(r#"{"event":"ping"}"#);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::WriteFailed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_wakes_reader() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (task, peer) = open(&lifecycle(&registry), "conn-1", "u1");
        settle().await;

        // Same order the delivery engine uses.
        let entry = registry.remove(&"conn-1".into()).unwrap();
        entry.evict();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::Evicted);
        assert!(registry.is_empty());
        assert!(peer.is_closed_by_server());
    }

    #[tokio::test]
    async fn test_duplicate_handle_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let lifecycle = lifecycle(&registry);
        let (first, _first_peer) = open(&lifecycle, "conn-1", "u1");
        settle().await;

        let (second, second_peer) = open(&lifecycle, "conn-1", "u2");
        let result = second.await.unwrap();
        assert!(matches!(result, Err(RegistryError::DuplicateConnection(_))));
        assert!(second_peer.is_closed_by_server());

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&"conn-1".into()).unwrap().identity(),
            &Identity::new("u1")
        );
        first.abort();
    }
}
