//! In-memory authenticator

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AuthKey, Authenticator};

/// Authenticator backed by a map held in memory
///
/// Records can be added and removed while the broker is running; lookups see
/// the latest state.
#[derive(Debug, Default)]
pub struct MemoryAuthenticator {
    keys: RwLock<HashMap<String, AuthKey>>,
}

impl MemoryAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an authenticator pre-populated with `keys`
    pub fn with_keys(keys: impl IntoIterator<Item = AuthKey>) -> Self {
        let auth = Self::new();
        for key in keys {
            auth.insert(key);
        }
        auth
    }

    /// Add or replace the record for `key.ident`
    pub fn insert(&self, key: AuthKey) -> Option<AuthKey> {
        self.keys.write().insert(key.ident.clone(), key)
    }

    pub fn remove(&self, ident: &str) -> Option<AuthKey> {
        self.keys.write().remove(ident)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn get_auth_key(&self, ident: &str) -> Option<AuthKey> {
        self.keys.read().get(ident).cloned()
    }

    async fn close(&self) {
        tracing::debug!(keys = self.len(), "Memory authenticator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_known_and_unknown() {
        let auth = MemoryAuthenticator::with_keys([AuthKey::new("alice", "a", "pw")]);

        let key = auth.get_auth_key("alice").await.unwrap();
        assert_eq!(key.secret, "pw");
        assert!(auth.get_auth_key("mallory").await.is_none());
    }

    #[tokio::test]
    async fn test_insert_replaces_and_remove() {
        let auth = MemoryAuthenticator::new();
        assert!(auth.is_empty());

        assert!(auth.insert(AuthKey::new("bob", "b", "one")).is_none());
        let old = auth.insert(AuthKey::new("bob", "b", "two")).unwrap();
        assert_eq!(old.secret, "one");
        assert_eq!(auth.len(), 1);

        assert_eq!(auth.get_auth_key("bob").await.unwrap().secret, "two");
        auth.remove("bob");
        assert!(auth.get_auth_key("bob").await.is_none());
    }
}
