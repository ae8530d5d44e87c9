//! Error types
//!
//! `BrokerError` covers startup and lifecycle failures. Framing failures live in
//! [`ProtocolError`] and only ever close the session that produced them.

use std::io;

use crate::protocol::ProtocolError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Malformed endpoint string, bad port, or no listen mechanism
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The listening transport could not be created
    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Operation not valid in the broker's current lifecycle state
    #[error("broker is {0}, operation not permitted")]
    InvalidState(&'static str),

    /// The broker stopped before it became ready
    #[error("broker stopped before it was started")]
    NotStarted,

    /// Wire protocol violation
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error outside of bind
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BrokerError {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        BrokerError::InvalidConfiguration(msg.into())
    }
}
