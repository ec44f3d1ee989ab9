//! The bridge core: per-user virtualized IRC sessions and the process-wide
//! resources they share.

pub mod broker;
pub mod client;
pub mod config;
pub mod conn;
pub mod ident;
pub mod identity;
pub mod metrics;
pub mod nick;

pub use broker::{BridgeEvent, ClientRef, EventBroker};
pub use client::{BridgedClient, ClientError, IrcRoom};
pub use config::{AdvancedSettings, ClientConfig, MirrorPhase, ServerConfig};
pub use conn::Connection;
pub use ident::IdentRegistry;
pub use identity::{IdentityGenerator, Ipv6Allocator};
