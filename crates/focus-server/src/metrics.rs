//! Metrics collection and export for the focus server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use focus_core::DeliveryStatsSnapshot;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "focus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "focus_connections_active";
    pub const AUTH_REJECTIONS_TOTAL: &str = "focus_auth_rejections_total";
    pub const MESSAGES_TOTAL: &str = "focus_messages_total";
    pub const EVENTS_DELIVERED: &str = "focus_events_delivered";
    pub const EVENTS_DROPPED: &str = "focus_events_dropped";
    pub const WRITE_FAILURES: &str = "focus_write_failures";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::AUTH_REJECTIONS_TOTAL,
        "Requests rejected by the session gate"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(
        names::EVENTS_DELIVERED,
        "Event frames written to connections"
    );
    metrics::describe_counter!(
        names::EVENTS_DROPPED,
        "Events dropped because the delivery queue was full"
    );
    metrics::describe_counter!(
        names::WRITE_FAILURES,
        "Failed writes that evicted a connection"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a request turned away by the session gate.
pub fn record_auth_rejection(endpoint: &'static str) {
    counter!(names::AUTH_REJECTIONS_TOTAL, "endpoint" => endpoint).increment(1);
}

/// Record frames in one direction.
pub fn record_messages(direction: &'static str, count: u64) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(count);
}

/// Mirror the delivery engine's counters.
pub fn publish_delivery_stats(stats: &DeliveryStatsSnapshot) {
    counter!(names::EVENTS_DELIVERED).absolute(stats.delivered);
    counter!(names::EVENTS_DROPPED).absolute(stats.dropped);
    counter!(names::WRITE_FAILURES).absolute(stats.write_failures);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        let _guard = ConnectionMetricsGuard::new();
        record_auth_rejection("ws");
        record_messages("inbound", 3);
        publish_delivery_stats(&DeliveryStatsSnapshot::default());
    }
}
