//! estuary — bridged IRC client core.
//!
//! One [`bridge::BridgedClient`] stands in for one home-side user on an IRC
//! network: it owns the TCP connection, drives registration, joins and parts
//! channels, relays messages both ways through the event broker, and enforces
//! idle liveness. The `irc` module is the minimal line-level layer underneath.

pub mod bridge;
pub mod irc;
