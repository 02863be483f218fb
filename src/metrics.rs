//! Counter and gauge names emitted by the engine.
//!
//! Everything goes through the `metrics` facade: installing a recorder
//! (Prometheus exporter, test capture, ...) is how a deployment plugs in a
//! sink. Nothing is persisted here.

pub const CONNECTIONS_OPEN: &str = "knoxy_connections_open";
pub const BYTES_RECEIVED: &str = "knoxy_bytes_received_total";
pub const BYTES_SENT: &str = "knoxy_bytes_sent_total";
pub const STATE_TRANSITIONS: &str = "knoxy_state_transitions_total";
pub const SHORT_CIRCUITS: &str = "knoxy_short_circuits_total";
pub const PROTOCOL_ERRORS: &str = "knoxy_protocol_errors_total";
pub const FILTER_ERRORS: &str = "knoxy_filter_errors_total";

pub(crate) fn connection_opened() {
    ::metrics::gauge!(CONNECTIONS_OPEN).increment(1.0);
}

pub(crate) fn connection_closed() {
    ::metrics::gauge!(CONNECTIONS_OPEN).decrement(1.0);
}

pub(crate) fn state_transition(to: &'static str) {
    ::metrics::counter!(STATE_TRANSITIONS, "to" => to).increment(1);
}

pub(crate) fn bytes_received(n: usize) {
    ::metrics::counter!(BYTES_RECEIVED).increment(n as u64);
}

pub(crate) fn bytes_sent(n: usize) {
    ::metrics::counter!(BYTES_SENT).increment(n as u64);
}

pub(crate) fn short_circuit() {
    ::metrics::counter!(SHORT_CIRCUITS).increment(1);
}

pub(crate) fn protocol_error() {
    ::metrics::counter!(PROTOCOL_ERRORS).increment(1);
}

pub(crate) fn filter_error(name: &'static str) {
    ::metrics::counter!(FILTER_ERRORS, "filter" => name).increment(1);
}
