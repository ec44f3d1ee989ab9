//! Metric name constants for the bridge core.
//!
//! Call sites use these constants rather than raw strings to prevent typos
//! and keep renaming centralized. The `metrics` facade is a no-op until the
//! embedding process installs a recorder.

use metrics::{counter, gauge};

/// Total successful IRC registrations (counter).
pub const CONNECTS: &str = "estuary_irc_connects_total";
/// Total failed connection attempts (counter).
pub const CONNECT_FAILURES: &str = "estuary_irc_connect_failures_total";
/// Total disconnects, any cause (counter).
pub const DISCONNECTS: &str = "estuary_irc_disconnects_total";
/// Currently live connections (gauge).
pub const CONNECTED_CLIENTS: &str = "estuary_irc_clients_connected";
/// Outbound actions dispatched, labeled by kind (counter).
pub const ACTIONS_SENT: &str = "estuary_irc_actions_sent_total";
/// Join attempts that needed more than one round (counter).
pub const JOIN_RETRIES: &str = "estuary_irc_join_retries_total";
/// Sessions reaped by the idle timer (counter).
pub const IDLE_DISCONNECTS: &str = "estuary_irc_idle_disconnects_total";

#[inline]
pub fn record_connect(domain: &str) {
    let labels = [("server", domain.to_owned())];
    counter!(CONNECTS, &labels).increment(1);
    gauge!(CONNECTED_CLIENTS, &labels).increment(1.0);
}

#[inline]
pub fn record_connect_failure(domain: &str) {
    counter!(CONNECT_FAILURES, &[("server", domain.to_owned())]).increment(1);
}

#[inline]
pub fn record_disconnect(domain: &str) {
    let labels = [("server", domain.to_owned())];
    counter!(DISCONNECTS, &labels).increment(1);
    gauge!(CONNECTED_CLIENTS, &labels).decrement(1.0);
}

#[inline]
pub fn record_action(kind: &str) {
    counter!(ACTIONS_SENT, &[("kind", kind.to_owned())]).increment(1);
}

#[inline]
pub fn record_join_retry(domain: &str) {
    counter!(JOIN_RETRIES, &[("server", domain.to_owned())]).increment(1);
}

#[inline]
pub fn record_idle_disconnect(domain: &str) {
    counter!(IDLE_DISCONNECTS, &[("server", domain.to_owned())]).increment(1);
}
