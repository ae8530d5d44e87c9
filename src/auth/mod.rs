//! Credential lookup
//!
//! The broker never stores credentials itself. It asks an [`Authenticator`]
//! for the [`AuthKey`] of an identity during the handshake and hands the
//! record to the session, which uses the channel sets for access checks.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;

pub use memory::MemoryAuthenticator;

/// Credential and authorization record for one client identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKey {
    /// Identity the client authenticates as
    pub ident: String,
    /// Owner of the identity (informational)
    pub owner: String,
    /// Shared secret used to verify the auth hash
    pub secret: String,
    /// Channels this identity may publish to
    pub pubchans: HashSet<String>,
    /// Channels this identity may subscribe to
    pub subchans: HashSet<String>,
}

impl AuthKey {
    /// Create a record with no channel permissions
    pub fn new(ident: impl Into<String>, owner: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            owner: owner.into(),
            secret: secret.into(),
            pubchans: HashSet::new(),
            subchans: HashSet::new(),
        }
    }

    /// Grant publish access to the given channels
    pub fn publish<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pubchans.extend(channels.into_iter().map(Into::into));
        self
    }

    /// Grant subscribe access to the given channels
    pub fn subscribe<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subchans.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn can_publish(&self, channel: &str) -> bool {
        self.pubchans.contains(channel)
    }

    pub fn can_subscribe(&self, channel: &str) -> bool {
        self.subchans.contains(channel)
    }
}

/// Source of [`AuthKey`] records
///
/// `None` from [`get_auth_key`](Authenticator::get_auth_key) means the identity
/// is unknown; the session treats it as an authentication failure.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Look up the record for `ident`
    async fn get_auth_key(&self, ident: &str) -> Option<AuthKey>;

    /// Release any resources held by the backing store
    async fn close(&self) {}
}
