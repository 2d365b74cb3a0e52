//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "beacon_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const MESSAGES_BYTES: &str = "beacon_messages_bytes";
    pub const INDEX_OPERATIONS: &str = "beacon_index_operations_total";
    pub const INDEX_LATENCY_SECONDS: &str = "beacon_index_latency_seconds";
    pub const AUTH_TOTAL: &str = "beacon_auth_total";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
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
        names::CONNECTIONS_REJECTED,
        "Connections refused at the connection limit"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(
        names::INDEX_OPERATIONS,
        "Index writes by operation and outcome"
    );
    metrics::describe_histogram!(
        names::INDEX_LATENCY_SECONDS,
        "Time from submitting an index write to its acknowledgment"
    );
    metrics::describe_counter!(names::AUTH_TOTAL, "Authentication attempts by outcome");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

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

/// Record a connection refused at the limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an index write and how long its acknowledgment took.
pub fn record_index_operation(op: &'static str, success: bool, elapsed: Duration) {
    let outcome = if success { "ok" } else { "error" };
    counter!(names::INDEX_OPERATIONS, "op" => op, "outcome" => outcome).increment(1);
    histogram!(names::INDEX_LATENCY_SECONDS, "op" => op).record(elapsed.as_secs_f64());
}

/// Record an authentication attempt.
pub fn record_auth(success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!(names::AUTH_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
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
