//! Counter metrics

use super::labels;

/// A connect attempt started
pub fn connect_attempted(server: &str) {
    metrics::counter!("broker_tether_connect_attempts_total", labels::SERVER => server.to_string())
        .increment(1);
}

/// A connection and its channel are open
pub fn connect_succeeded(server: &str, security: &'static str) {
    metrics::counter!(
        "broker_tether_connect_success_total",
        labels::SERVER => server.to_string(),
        labels::SECURITY => security
    )
    .increment(1);
}

/// A connect attempt failed
pub fn connect_failed(server: &str, kind: &'static str) {
    metrics::counter!(
        "broker_tether_connect_failures_total",
        labels::SERVER => server.to_string(),
        labels::KIND => kind
    )
    .increment(1);
}

/// A transport connection was closed cleanly
pub fn connection_closed() {
    metrics::counter!("broker_tether_connections_closed_total").increment(1);
}

/// A handler was subscribed to a queue
pub fn consumer_registered(queue: &str) {
    metrics::counter!("broker_tether_consumers_registered_total", labels::QUEUE => queue.to_string())
        .increment(1);
}

/// A consumer went away
pub fn consumer_cancelled(queue: &str, origin: &'static str) {
    metrics::counter!(
        "broker_tether_consumers_cancelled_total",
        labels::QUEUE => queue.to_string(),
        labels::ORIGIN => origin
    )
    .increment(1);
}

/// A delivery was passed to its handler
pub fn delivery_handled(queue: &str, disposition: &'static str) {
    metrics::counter!(
        "broker_tether_deliveries_total",
        labels::QUEUE => queue.to_string(),
        labels::DISPOSITION => disposition
    )
    .increment(1);
}

/// A delivery arrived for a consumer tag with no handler
pub fn delivery_unroutable() {
    metrics::counter!("broker_tether_deliveries_unroutable_total").increment(1);
}

/// A malformed frame was dropped
pub fn frame_decode_error() {
    metrics::counter!("broker_tether_frame_decode_errors_total").increment(1);
}

/// The reconnect loop scheduled another attempt
pub fn retry_scheduled(kind: &'static str) {
    metrics::counter!("broker_tether_retries_total", labels::KIND => kind).increment(1);
}

/// The reconnect loop terminated
pub fn run_exited(reason: &'static str) {
    metrics::counter!("broker_tether_run_exits_total", labels::REASON => reason).increment(1);
}
