//! The hub: what the rest of the application talks to.

use focus_protocol::Identity;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::delivery::{
    self, DeliveryConfig, DeliveryEngine, DeliveryHandle, DeliveryStatsSnapshot, Dispatch,
};
use crate::event::OutboundEvent;
use crate::lifecycle::{ConnectionLifecycle, LifecycleConfig};
use crate::registry::ConnectionRegistry;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The payload could not be converted to JSON.
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Registry, delivery handle and lifecycle wired together.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    delivery: DeliveryHandle,
    lifecycle: ConnectionLifecycle,
}

impl Hub {
    /// Build a hub around a fresh registry.
    ///
    /// The returned engine must be spawned for events to go anywhere.
    #[must_use]
    pub fn new(
        delivery_config: DeliveryConfig,
        lifecycle_config: LifecycleConfig,
    ) -> (Self, DeliveryEngine) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, engine) = delivery::channel(registry.clone(), delivery_config);
        let hub = Self {
            lifecycle: ConnectionLifecycle::new(registry.clone(), lifecycle_config),
            registry,
            delivery: handle,
        };
        (hub, engine)
    }

    /// Push an event to one user.
    ///
    /// Users with several open connections receive it on the earliest one.
    /// Users with none are skipped silently.
    ///
    /// # Errors
    ///
    /// Returns an error only if the payload cannot be serialized.
    pub fn send_to_user<T: Serialize>(
        &self,
        identity: &Identity,
        event: &str,
        payload: &T,
    ) -> Result<Dispatch, HubError> {
        let payload = serde_json::to_value(payload)?;
        let event = OutboundEvent::to(identity.clone(), event, payload);
        Ok(self.delivery.send_to_identity(identity, event))
    }

    /// Push an event to every open connection.
    ///
    /// # Errors
    ///
    /// Returns an error only if the payload cannot be serialized.
    pub fn broadcast<T: Serialize>(&self, event: &str, payload: &T) -> Result<Dispatch, HubError> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.delivery.send_to_all(OutboundEvent::broadcast(event, payload)))
    }

    /// Push an event to the participants of a focus session.
    ///
    /// Nothing here knows which users belong to which session, so this is
    /// a broadcast to every open connection.
    ///
    /// # Errors
    ///
    /// Returns an error only if the payload cannot be serialized.
    pub fn send_to_session_participants<T: Serialize>(
        &self,
        session_id: &str,
        event: &str,
        payload: &T,
    ) -> Result<Dispatch, HubError> {
        debug!(session = session_id, event, "Session event sent to all connections");
        self.broadcast(event, payload)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn delivery(&self) -> &DeliveryHandle {
        &self.delivery
    }

    #[must_use]
    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    #[must_use]
    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.delivery.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PendingConnection;
    use focus_transport::memory::{self, MemoryPeer};
    use serde_json::json;
    use std::time::Duration;

    fn hub() -> Hub {
        let (hub, engine) = Hub::new(DeliveryConfig::default(), LifecycleConfig::default());
        engine.spawn();
        hub
    }

    fn connect(hub: &Hub, id: &str, who: &str) -> MemoryPeer {
        let (sink, stream, peer) = memory::pair();
        let conn = PendingConnection::new(id.into())
            .authenticate::<String>(Ok(Identity::new(who)))
            .unwrap();
        let lifecycle = hub.lifecycle().clone();
        tokio::spawn(async move { lifecycle.run(conn, sink, stream).await });
        peer
    }

    async fn wait_for(hub: &Hub, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.registry().len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    async fn next_text(peer: &mut MemoryPeer) -> String {
        tokio::time::timeout(Duration::from_secs(1), peer.recv_text())
            .await
            .expect("timed out waiting for frame")
            .expect("peer channel closed")
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let hub = hub();
        let mut u1 = connect(&hub, "conn-1", "u1");
        let mut u2 = connect(&hub, "conn-2", "u2");
        wait_for(&hub, 2).await;

        assert!(hub.broadcast("tick", &json!({})).unwrap().is_queued());
        assert_eq!(next_text(&mut u1).await, r#"{"event":"tick","data":{}}"#);
        assert_eq!(next_text(&mut u2).await, r#"{"event":"tick","data":{}}"#);
    }

    #[tokio::test]
    async fn test_send_to_user_with_typed_payload() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct TaskCompleted {
            task_id: u32,
            session_id: &'static str,
        }

        let hub = hub();
        let mut u1 = connect(&hub, "conn-1", "u1");
        let mut u2 = connect(&hub, "conn-2", "u2");
        wait_for(&hub, 2).await;

        let payload = TaskCompleted {
            task_id: 3,
            session_id: "s1",
        };
        hub.send_to_user(&Identity::new("u2"), "task:completed", &payload)
            .unwrap();

        let frame: serde_json::Value = serde_json::from_str(&next_text(&mut u2).await).unwrap();
        assert_eq!(
            frame,
            json!({"event": "task:completed", "data": {"taskId": 3, "sessionId": "s1"}})
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(u1.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_to_offline_user() {
        let hub = hub();
        let dispatch = hub
            .send_to_user(&Identity::new("nobody"), "hello", &json!({}))
            .unwrap();
        assert_eq!(dispatch, Dispatch::NoRecipient);
        assert_eq!(hub.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_session_participants_gets_everyone() {
        let hub = hub();
        let mut u1 = connect(&hub, "conn-1", "u1");
        let mut u2 = connect(&hub, "conn-2", "u2");
        wait_for(&hub, 2).await;

        hub.send_to_session_participants("s1", "session:ended", &json!({"sessionId": "s1"}))
            .unwrap();
        let expected = r#"{"event":"session:ended","data":{"sessionId":"s1"}}"#;
        assert_eq!(next_text(&mut u1).await, expected);
        assert_eq!(next_text(&mut u2).await, expected);
    }

    #[tokio::test]
    async fn test_unserializable_payload() {
        let hub = hub();
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");
        assert!(matches!(
            hub.broadcast("bad", &bad),
            Err(HubError::Serialize(_))
        ));
    }

    #[tokio::test]
    async fn test_abrupt_close_leaves_other_user_reachable() {
        let hub = hub();
        let u1 = connect(&hub, "conn-1", "u1");
        let mut u2 = connect(&hub, "conn-2", "u2");
        wait_for(&hub, 2).await;

        drop(u1);
        wait_for(&hub, 1).await;
        assert!(!hub.registry().contains(&"conn-1".into()));

        hub.broadcast("tick", &json!({})).unwrap();
        assert_eq!(next_text(&mut u2).await, r#"{"event":"tick","data":{}}"#);
    }
}
