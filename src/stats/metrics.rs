//! Broker metrics
//!
//! Observability hooks called by the registry and sessions. Everything goes
//! through the `metrics` facade; whichever recorder is installed (the
//! Prometheus exporter in production, a local recorder in tests) receives it.

use metrics::{counter, gauge, histogram};

/// Publishes received (counter, labels: ident, chan).
pub const RECEIVE_PUBLISH_COUNT: &str = "hpfeeds_broker_receive_publish_count";
/// Size of received publish payloads in bytes (histogram, labels: ident, chan).
pub const RECEIVE_PUBLISH_SIZE: &str = "hpfeeds_broker_receive_publish_size";
/// Bytes queued towards a client and not yet written (gauge, labels: ident).
pub const CLIENT_SEND_BUFFER_FILL: &str = "hpfeeds_broker_client_send_buffer_fill";
/// Active subscriptions (gauge, labels: ident, chan).
pub const SUBSCRIPTIONS: &str = "hpfeeds_broker_subscriptions";
/// Attached, authenticated connections (gauge).
pub const CLIENT_CONNECTIONS: &str = "hpfeeds_broker_client_connections";

/// Record one publish from `ident` on `chan`
pub fn record_publish(ident: &str, chan: &str, size: usize) {
    counter!(RECEIVE_PUBLISH_COUNT, "ident" => ident.to_owned(), "chan" => chan.to_owned())
        .increment(1);
    histogram!(RECEIVE_PUBLISH_SIZE, "ident" => ident.to_owned(), "chan" => chan.to_owned())
        .record(size as f64);
}

pub fn subscription_added(ident: &str, chan: &str) {
    gauge!(SUBSCRIPTIONS, "ident" => ident.to_owned(), "chan" => chan.to_owned()).increment(1.0);
}

pub fn subscription_removed(ident: &str, chan: &str) {
    gauge!(SUBSCRIPTIONS, "ident" => ident.to_owned(), "chan" => chan.to_owned()).decrement(1.0);
}

/// Bytes handed to `ident`'s outbound queue
pub fn send_buffer_filled(ident: &str, bytes: usize) {
    gauge!(CLIENT_SEND_BUFFER_FILL, "ident" => ident.to_owned()).increment(bytes as f64);
}

/// Bytes written out of (or dropped from) `ident`'s outbound queue
pub fn send_buffer_drained(ident: &str, bytes: usize) {
    gauge!(CLIENT_SEND_BUFFER_FILL, "ident" => ident.to_owned()).decrement(bytes as f64);
}

pub fn set_connections(count: usize) {
    gauge!(CLIENT_CONNECTIONS).set(count as f64);
}
