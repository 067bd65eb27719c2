//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ticket_key_rotations_total` (counter): rotations by outcome
//! - `ticket_key_fetches_total` (counter): cache fetches by outcome
//! - `ticket_keys_active` (gauge): keys in the published set, 0 when invalidated
//! - `control_opcodes_total` (counter): control commands by opcode
//! - `worker_connections_active` (gauge): open connections per worker
//!
//! Without an installed exporter every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint. Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_rotation(outcome: &'static str) {
    metrics::counter!("ticket_key_rotations_total", "outcome" => outcome).increment(1);
}

pub fn record_fetch(outcome: &'static str) {
    metrics::counter!("ticket_key_fetches_total", "outcome" => outcome).increment(1);
}

pub fn record_active_keys(count: usize) {
    metrics::gauge!("ticket_keys_active").set(count as f64);
}

pub fn record_control_opcode(opcode: &'static str) {
    metrics::counter!("control_opcodes_total", "opcode" => opcode).increment(1);
}

pub fn record_worker_connections(worker: usize, count: u64) {
    metrics::gauge!("worker_connections_active", "worker" => worker.to_string()).set(count as f64);
}
