//! Histogram metrics

use super::labels;

/// Time from connect start to an open channel, in milliseconds
pub fn connect_duration(server: &str, duration_ms: u64) {
    metrics::histogram!("broker_tether_connect_duration_ms", labels::SERVER => server.to_string())
        .record(duration_ms as f64);
}

/// Deliveries dispatched by one drain call
pub fn drain_batch_size(dispatched: usize) {
    metrics::histogram!("broker_tether_drain_batch_size").record(dispatched as f64);
}
