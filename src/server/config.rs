//! Broker configuration

use std::time::Duration;

use super::endpoint::Endpoint;
use crate::error::Result;
use crate::protocol::constants::{DEFAULT_BROKER_NAME, DEFAULT_MAX_MESSAGE_SIZE};

/// Broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker name announced to clients in the INFO message
    pub name: String,

    /// Address to listen on
    pub bind: Endpoint,

    /// Address for the Prometheus exposition server (unconfigured = disabled)
    pub metrics: Endpoint,

    /// Largest frame accepted from or sent to a client, header included
    pub max_message_size: usize,

    /// Per-connection outbound queue capacity, in messages
    pub outbound_queue: usize,

    /// Time a client has to send AUTH after connecting
    pub auth_timeout: Duration,

    /// How long shutdown waits for sessions to close
    pub drain_timeout: Duration,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_BROKER_NAME.to_string(),
            bind: Endpoint::new("0.0.0.0", "10000"),
            metrics: Endpoint::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue: 1024,
            auth_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            max_connections: 0, // Unlimited
        }
    }
}

impl BrokerConfig {
    /// Build a config from `host:port` strings
    ///
    /// `bind` is required unless the broker is given a pre-bound socket;
    /// an absent `metrics` disables the exposition server.
    pub fn from_specs(bind: Option<&str>, metrics: Option<&str>) -> Result<Self> {
        Ok(Self {
            bind: Endpoint::parse(bind)?,
            metrics: Endpoint::parse(metrics)?,
            ..Default::default()
        })
    }

    /// Set the broker name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the listen endpoint
    pub fn bind(mut self, endpoint: Endpoint) -> Self {
        self.bind = endpoint;
        self
    }

    /// Set the metrics endpoint
    pub fn metrics(mut self, endpoint: Endpoint) -> Self {
        self.metrics = endpoint;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the outbound queue capacity (at least 1)
    pub fn outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}
