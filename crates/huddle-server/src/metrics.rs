//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use huddle_core::DeliveryReport;
use huddle_protocol::ErrorCode;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const CONNECTIONS_REFUSED: &str = "huddle_connections_refused_total";
    pub const FRAMES_INBOUND: &str = "huddle_frames_inbound_total";
    pub const DELIVERIES_TOTAL: &str = "huddle_deliveries_total";
    pub const WRITES_FAILED: &str = "huddle_writes_failed_total";
    pub const ROOMS_ACTIVE: &str = "huddle_rooms_active";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
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
        names::CONNECTIONS_REFUSED,
        "Upgrades refused because the connection limit was reached"
    );
    metrics::describe_counter!(names::FRAMES_INBOUND, "Total number of inbound frames");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of dispatched deliveries by target kind"
    );
    metrics::describe_counter!(names::WRITES_FAILED, "Total number of failed socket writes");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by code");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

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

/// Record a refused upgrade.
pub fn record_refused() {
    counter!(names::CONNECTIONS_REFUSED).increment(1);
}

/// Record an inbound frame.
pub fn record_frame() {
    counter!(names::FRAMES_INBOUND).increment(1);
}

/// Record a dispatched delivery.
pub fn record_delivery(report: &DeliveryReport) {
    counter!(names::DELIVERIES_TOTAL, "kind" => report.kind).increment(1);
    if report.failed > 0 {
        counter!(names::WRITES_FAILED).increment(report.failed as u64);
    }
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error reported to a client.
pub fn record_error(code: ErrorCode) {
    counter!(names::ERRORS_TOTAL, "code" => code.as_str()).increment(1);
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
