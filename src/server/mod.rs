//! Broker server
//!
//! [`Broker`] owns the listening socket and the lifecycle; each accepted
//! socket runs as its own session task bound to the shared registry.

pub mod config;
pub(crate) mod connection;
pub mod endpoint;
pub mod listener;

pub use config::BrokerConfig;
pub use endpoint::Endpoint;
pub use listener::{Broker, BrokerState};
