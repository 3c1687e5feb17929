//! Metrics collection and exposition.
//!
//! # Metrics
//! - `fanout_admissions_total` (counter): exchanges registered, retries included
//! - `fanout_retries_total` (counter): replacement requests admitted
//! - `fanout_registration_failures_total` (counter): refused registrations
//! - `fanout_deliveries_total` (counter): completions accepted as final, by `outcome`
//! - `fanout_exchange_duration_seconds` (histogram): per-exchange latency
//! - `fanout_active_handles` (gauge): current active set size
//!
//! # Design Decisions
//! - Recording without an installed exporter is a no-op
//! - Outcome labels are fixed strings to keep cardinality bounded

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

pub fn record_admission(retry: bool) {
    counter!("fanout_admissions_total").increment(1);
    if retry {
        counter!("fanout_retries_total").increment(1);
    }
}

pub fn record_registration_failure() {
    counter!("fanout_registration_failures_total").increment(1);
}

pub fn record_exchange(duration: Duration) {
    histogram!("fanout_exchange_duration_seconds").record(duration.as_secs_f64());
}

/// Record a final completion. `outcome` is one of `ok`, `network`, `request`.
pub fn record_delivery(outcome: &'static str) {
    counter!("fanout_deliveries_total", "outcome" => outcome).increment(1);
}

pub fn set_active_handles(count: usize) {
    gauge!("fanout_active_handles").set(count as f64);
}
