//! # focus-core
//!
//! Real-time connection hub for focus sessions.
//!
//! - **Registry** - the live set of authenticated connections
//! - **Delivery** - queued, non-blocking fan-out plus the liveness sweep
//! - **Lifecycle** - per-connection read loop and teardown
//! - **Hub** - the `send_to_user` / `broadcast` API used by the application
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  add/remove  ┌─────────────┐  for_each  ┌─────────────┐
//! │  Lifecycle  │─────────────▶│  Registry   │◀───────────│  Delivery   │
//! └─────────────┘              └─────────────┘            └─────────────┘
//!                                                                ▲
//!                                                     enqueue    │
//!                                                  ┌─────────────┐
//!                                                  │     Hub     │
//!                                                  └─────────────┘
//! ```

pub mod delivery;
pub mod event;
pub mod hub;
pub mod lifecycle;
pub mod registry;

pub use delivery::{
    DeliveryConfig, DeliveryEngine, DeliveryHandle, DeliveryStats, DeliveryStatsSnapshot, Dispatch,
};
pub use event::OutboundEvent;
pub use hub::{Hub, HubError};
pub use lifecycle::{
    AuthenticatedConnection, CloseReason, ConnectionLifecycle, ConnectionState, ConnectionSummary,
    LifecycleConfig, PendingConnection,
};
pub use registry::{ConnectionEntry, ConnectionRegistry, RegistryError, VisitReport};
