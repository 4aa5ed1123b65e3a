//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define connection, handshake and stream metrics
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `gatehouse_connections_accepted_total` (counter): TCP connections accepted
//! - `gatehouse_connections_rejected_total` (counter): connections over the admission quota
//! - `gatehouse_active_connections` (gauge): connections currently in the chain
//! - `gatehouse_tls_handshakes_total` (counter): handshakes by `outcome`
//! - `gatehouse_tls_handshake_duration_seconds` (histogram): successful handshake latency
//! - `gatehouse_quic_streams_aborted_total` (counter): stream aborts by `direction`
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed, so library users and
//!   tests pay nothing
//! - Label values are fixed strings to keep cardinality bounded

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to start metrics endpoint"),
    }
}

pub fn record_connection_accepted() {
    metrics::counter!("gatehouse_connections_accepted_total").increment(1);
}

pub fn record_connection_rejected() {
    metrics::counter!("gatehouse_connections_rejected_total").increment(1);
}

pub fn record_active_connections(count: u64) {
    metrics::gauge!("gatehouse_active_connections").set(count as f64);
}

/// Handshake outcome: `success`, `timeout`, `aborted`, `io`, `authentication`, `configuration`.
pub fn record_tls_handshake(outcome: &'static str) {
    metrics::counter!("gatehouse_tls_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_tls_handshake_duration(elapsed: Duration) {
    metrics::histogram!("gatehouse_tls_handshake_duration_seconds").record(elapsed.as_secs_f64());
}

/// Direction: `read` or `write`.
pub fn record_stream_aborted(direction: &'static str) {
    metrics::counter!("gatehouse_quic_streams_aborted_total", "direction" => direction)
        .increment(1);
}
