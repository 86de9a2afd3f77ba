//! Metrics collection and exposition.
//!
//! # Metrics
//! - `broker_connection_attempts_total` (counter): connect messages by listener
//! - `broker_handshake_rejected_total` (counter): dropped streams by reason
//! - `broker_loop_detected_total` (counter): reconnect loop warnings
//! - `broker_signing_requests_total` (counter): CSR outcomes by delivery mode
//! - `broker_sessions` (gauge): live registry entries
//! - `broker_open_streams` (gauge): accepted streams not yet closed

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_attempt(listener: &'static str) {
    counter!("broker_connection_attempts_total", "listener" => listener).increment(1);
}

pub fn record_handshake_rejected(reason: &'static str) {
    counter!("broker_handshake_rejected_total", "reason" => reason).increment(1);
}

pub fn record_loop_detected() {
    counter!("broker_loop_detected_total").increment(1);
}

pub fn record_signing(mode: &'static str, outcome: &'static str) {
    counter!("broker_signing_requests_total", "mode" => mode, "outcome" => outcome).increment(1);
}

pub fn record_sessions(count: usize) {
    gauge!("broker_sessions").set(count as f64);
}

pub fn record_open_streams(count: u64) {
    gauge!("broker_open_streams").set(count as f64);
}
