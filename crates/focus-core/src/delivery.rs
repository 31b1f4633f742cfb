//! Broadcast/delivery engine.
//!
//! Producers submit events through a cloneable [`DeliveryHandle`] without
//! ever blocking; a single [`DeliveryEngine`] task drains the bounded queue
//! and fans each event out to the registry. The same task runs the periodic
//! liveness sweep.
//!
//! Every write carries its own deadline and writes within one pass run
//! concurrently, so a stalled peer never holds up the other recipients of
//! the same event. Passes are sequential, though: until the stalled peer's
//! write times out and it is evicted, the next event waits, for at most
//! `write_timeout`. A failed write evicts that one entry.

use focus_protocol::Identity;
use focus_transport::{close_within, send_within, Outbound, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::event::OutboundEvent;
use crate::registry::{ConnectionEntry, ConnectionRegistry};

/// Delivery engine configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Bounded queue capacity; submissions beyond it are dropped.
    pub queue_capacity: usize,
    /// Deadline for a single write to a single connection.
    pub write_timeout: Duration,
    /// Period of the liveness sweep.
    pub ping_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// What happened to a submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Accepted into the queue.
    Queued,
    /// Dropped: the queue was full.
    QueueFull,
    /// Dropped: the engine has stopped.
    Closed,
    /// Dropped: the target identity has no open connection.
    NoRecipient,
}

impl Dispatch {
    #[must_use]
    pub fn is_queued(self) -> bool {
        self == Dispatch::Queued
    }
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    write_failures: AtomicU64,
    evicted: AtomicU64,
    sweeps: AtomicU64,
}

impl DeliveryStats {
    /// Copy the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Point-in-time delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    /// Events accepted into the queue.
    pub enqueued: u64,
    /// Events dropped because the queue was full or closed.
    pub dropped: u64,
    /// Successful per-connection writes of events.
    pub delivered: u64,
    /// Failed per-connection writes (events and probes).
    pub write_failures: u64,
    /// Entries removed after a failed write.
    pub evicted: u64,
    /// Completed liveness sweeps.
    pub sweeps: u64,
}

/// Create a connected handle/engine pair.
#[must_use]
pub fn channel(
    registry: Arc<ConnectionRegistry>,
    config: DeliveryConfig,
) -> (DeliveryHandle, DeliveryEngine) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let stats = Arc::new(DeliveryStats::default());

    let handle = DeliveryHandle {
        tx,
        registry: registry.clone(),
        stats: stats.clone(),
    };
    let engine = DeliveryEngine {
        rx,
        registry,
        config,
        stats,
    };
    (handle, engine)
}

/// Submission side of the delivery engine.
#[derive(Clone)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<OutboundEvent>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<DeliveryStats>,
}

impl DeliveryHandle {
    /// Submit an event without blocking. Dropped if the queue is full.
    pub fn enqueue(&self, event: OutboundEvent) -> Dispatch {
        let event_targeted = event.is_targeted();
        match self.tx.try_send(event) {
            Ok(()) => {
                DeliveryStats::bump(&self.stats.enqueued, 1);
                trace!(targeted = event_targeted, "Event queued");
                Dispatch::Queued
            }
            Err(TrySendError::Full(event)) => {
                DeliveryStats::bump(&self.stats.dropped, 1);
                warn!(event = %event.name, "Delivery queue full, dropping event");
                Dispatch::QueueFull
            }
            Err(TrySendError::Closed(event)) => {
                DeliveryStats::bump(&self.stats.dropped, 1);
                warn!(event = %event.name, "Delivery engine stopped, dropping event");
                Dispatch::Closed
            }
        }
    }

    /// Submit an event for every open connection.
    pub fn send_to_all(&self, event: OutboundEvent) -> Dispatch {
        self.enqueue(OutboundEvent {
            target: None,
            ..event
        })
    }

    /// Submit an event for one identity.
    ///
    /// Dropped without error when the identity has no open connection.
    pub fn send_to_identity(&self, identity: &Identity, event: OutboundEvent) -> Dispatch {
        if self.registry.find_by_identity(identity).is_none() {
            trace!(identity = %identity, event = %event.name, "No open connection for identity");
            return Dispatch::NoRecipient;
        }
        self.enqueue(OutboundEvent {
            target: Some(identity.clone()),
            ..event
        })
    }

    /// Current delivery counters.
    #[must_use]
    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }
}

/// The delivery task.
pub struct DeliveryEngine {
    rx: mpsc::Receiver<OutboundEvent>,
    registry: Arc<ConnectionRegistry>,
    config: DeliveryConfig,
    stats: Arc<DeliveryStats>,
}

impl DeliveryEngine {
    /// Run the engine on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Deliver events and sweep until every handle has been dropped.
    pub async fn run(mut self) {
        let period = self.config.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue_capacity = self.config.queue_capacity,
            write_timeout_ms = self.config.write_timeout.as_millis() as u64,
            ping_interval_ms = period.as_millis() as u64,
            "Delivery engine started"
        );

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.deliver(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.sweep().await,
            }
        }

        info!("Delivery engine stopped");
    }

    async fn deliver(&self, event: OutboundEvent) {
        let text = match event.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(event = %event.name, error = %e, "Failed to encode event");
                return;
            }
        };
        let frame = Outbound::Text(text);

        match &event.target {
            Some(identity) => {
                let Some(entry) = self.registry.find_by_identity(identity) else {
                    trace!(identity = %identity, event = %event.name, "Recipient went away");
                    return;
                };
                match send_within(entry.sink().as_ref(), frame, self.config.write_timeout).await {
                    Ok(()) => DeliveryStats::bump(&self.stats.delivered, 1),
                    Err(e) => self.evict(entry, &e),
                }
            }
            None => {
                let timeout = self.config.write_timeout;
                let report = self
                    .registry
                    .for_each(|entry| {
                        let frame = frame.clone();
                        async move { send_within(entry.sink().as_ref(), frame, timeout).await }
                    })
                    .await;

                DeliveryStats::bump(&self.stats.delivered, report.succeeded() as u64);
                trace!(
                    event = %event.name,
                    recipients = report.visited,
                    failures = report.failures.len(),
                    "Broadcast event"
                );
                for (entry, e) in report.failures {
                    self.evict(entry, &e);
                }
            }
        }
    }

    async fn sweep(&self) {
        let timeout = self.config.write_timeout;
        let report = self
            .registry
            .for_each(|entry| async move {
                send_within(entry.sink().as_ref(), Outbound::Ping, timeout).await
            })
            .await;

        DeliveryStats::bump(&self.stats.sweeps, 1);
        debug!(
            probed = report.visited,
            dead = report.failures.len(),
            "Liveness sweep"
        );
        for (entry, e) in report.failures {
            self.evict(entry, &e);
        }
    }

    // Removal is synchronous so the next pass never sees the entry; closing
    // the transport happens off the delivery task.
    fn evict(&self, entry: ConnectionEntry, cause: &TransportError) {
        DeliveryStats::bump(&self.stats.write_failures, 1);
        warn!(
            connection = %entry.id(),
            identity = %entry.identity(),
            error = %cause,
            idle_ms = entry.idle_for().as_millis() as u64,
            "Write failed, evicting connection"
        );

        if self.registry.remove(entry.id()).is_some() {
            DeliveryStats::bump(&self.stats.evicted, 1);
        }
        entry.evict();

        let limit = self.config.write_timeout;
        tokio::spawn(async move {
            if let Err(e) = close_within(entry.sink().as_ref(), limit).await {
                debug!(connection = %entry.id(), error = %e, "Close after eviction failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_transport::memory::{self, MemoryPeer};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            queue_capacity: 16,
            write_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(3600),
        }
    }

    fn connect(registry: &ConnectionRegistry, id: &str, who: &str) -> MemoryPeer {
        let (sink, _stream, peer) = memory::pair();
        registry.add(id.into(), Identity::new(who), sink).unwrap();
        peer
    }

    async fn next_text(peer: &mut MemoryPeer) -> String {
        tokio::time::timeout(Duration::from_secs(1), peer.recv_text())
            .await
            .expect("timed out waiting for frame")
            .expect("peer channel closed")
    }

    #[tokio::test]
    async fn test_send_to_all_delivers_one_copy_each() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut peers: Vec<MemoryPeer> = (0..5)
            .map(|i| connect(&registry, &format!("conn-{i}"), &format!("u{i}")))
            .collect();

        let (handle, engine) = channel(registry.clone(), config());
        let task = engine.spawn();

        let dispatch = handle.send_to_all(OutboundEvent::broadcast("tick", json!({})));
        assert_eq!(dispatch, Dispatch::Queued);

        for peer in &mut peers {
            assert_eq!(next_text(peer).await, r#"{"event":"tick","data":{}}"#);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for peer in &mut peers {
            assert!(peer.try_recv().is_none(), "received a duplicate copy");
        }

        drop(handle);
        task.await.unwrap();
        assert_eq!(registry.len(), 5);
    }

    #[tokio::test]
    async fn test_blocked_peer_does_not_delay_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut healthy: Vec<MemoryPeer> = (0..4)
            .map(|i| connect(&registry, &format!("conn-{i}"), &format!("u{i}")))
            .collect();
        let blocked = connect(&registry, "conn-blocked", "slow");
        blocked.stall();

        let mut cfg = config();
        cfg.write_timeout = Duration::from_secs(5);
        let (handle, engine) = channel(registry.clone(), cfg);
        let _task = engine.spawn();

        let started = std::time::Instant::now();
        handle.send_to_all(OutboundEvent::broadcast("tick", json!({})));
        for peer in &mut healthy {
            assert_eq!(next_text(peer).await, r#"{"event":"tick","data":{}}"#);
        }
        // Well under the 5s write deadline the stalled peer is holding.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(registry.contains(&"conn-blocked".into()));
    }

    #[tokio::test]
    async fn test_stalled_peer_evicted_after_write_timeout() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut healthy = connect(&registry, "conn-ok", "u1");
        let blocked = connect(&registry, "conn-blocked", "u2");
        blocked.stall();

        let mut cfg = config();
        cfg.write_timeout = Duration::from_millis(100);
        let (handle, engine) = channel(registry.clone(), cfg);
        let _task = engine.spawn();

        handle.send_to_all(OutboundEvent::broadcast("tick", json!({})));
        assert_eq!(next_text(&mut healthy).await, r#"{"event":"tick","data":{}}"#);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!registry.contains(&"conn-blocked".into()));
        assert!(registry.contains(&"conn-ok".into()));
        assert!(blocked.is_closed_by_server());

        let stats = handle.stats();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_failed_write_evicts_only_that_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut ok = connect(&registry, "conn-ok", "u1");
        let broken = connect(&registry, "conn-broken", "u2");
        broken.fail_writes();

        let (handle, engine) = channel(registry.clone(), config());
        let _task = engine.spawn();

        handle.send_to_all(OutboundEvent::broadcast("first", json!({"n": 1})));
        handle.send_to_all(OutboundEvent::broadcast("second", json!({"n": 2})));

        assert_eq!(next_text(&mut ok).await, r#"{"event":"first","data":{"n":1}}"#);
        assert_eq!(next_text(&mut ok).await, r#"{"event":"second","data":{"n":2}}"#);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&"conn-ok".into()));
    }

    #[tokio::test]
    async fn test_send_to_identity_targets_one_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut first = connect(&registry, "conn-1", "u1");
        let mut second = connect(&registry, "conn-2", "u1");
        let mut other = connect(&registry, "conn-3", "u2");

        let (handle, engine) = channel(registry.clone(), config());
        let _task = engine.spawn();

        let dispatch = handle.send_to_identity(
            &Identity::new("u1"),
            OutboundEvent::broadcast("task:done", json!({"taskId": 1})),
        );
        assert_eq!(dispatch, Dispatch::Queued);
        assert_eq!(
            next_text(&mut first).await,
            r#"{"event":"task:done","data":{"taskId":1}}"#
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second.try_recv().is_none());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_to_absent_identity_is_silent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut bystander = connect(&registry, "conn-1", "u1");

        let (handle, engine) = channel(registry.clone(), config());
        let _task = engine.spawn();

        let dispatch = handle.send_to_identity(
            &Identity::new("offline"),
            OutboundEvent::broadcast("hello", json!({})),
        );
        assert_eq!(dispatch, Dispatch::NoRecipient);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bystander.try_recv().is_none());
        let stats = handle.stats();
        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut cfg = config();
        cfg.queue_capacity = 2;
        // Engine is never started, so nothing drains the queue.
        let (handle, _engine) = channel(registry, cfg);

        assert_eq!(handle.enqueue(OutboundEvent::broadcast("a", json!({}))), Dispatch::Queued);
        assert_eq!(handle.enqueue(OutboundEvent::broadcast("b", json!({}))), Dispatch::Queued);
        assert_eq!(
            handle.enqueue(OutboundEvent::broadcast("c", json!({}))),
            Dispatch::QueueFull
        );

        let stats = handle.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_engine_stopped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, engine) = channel(registry, config());
        drop(engine);
        assert_eq!(
            handle.enqueue(OutboundEvent::broadcast("late", json!({}))),
            Dispatch::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_sweep_probes_and_reaps() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut alive = connect(&registry, "conn-alive", "u1");
        let dead = connect(&registry, "conn-dead", "u2");
        drop(dead);

        let mut cfg = config();
        cfg.ping_interval = Duration::from_secs(30);
        let (handle, engine) = channel(registry.clone(), cfg);
        let _task = engine.spawn();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(alive.recv().await, Some(Outbound::Ping));
        assert!(!registry.contains(&"conn-dead".into()));
        assert!(registry.contains(&"conn-alive".into()));
        assert_eq!(handle.stats().sweeps, 1);
    }
}
