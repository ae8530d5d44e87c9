//! Subscription registry implementation
//!
//! The central registry that maps channels to subscribed connections and
//! routes published messages to them.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::entry::ConnectionHandle;
use crate::auth::{AuthKey, Authenticator};
use crate::stats::metrics;

/// Routing state guarded by the registry lock
#[derive(Default)]
struct RegistryState {
    /// Channel → subscribers in subscribe order. Entries are never removed.
    channels: HashMap<String, Vec<Arc<ConnectionHandle>>>,

    /// Attached connections by ID
    connections: HashMap<u64, Arc<ConnectionHandle>>,
}

/// Central registry for channel subscriptions
///
/// A single mutex covers the routing table, the connection set, and every
/// handle's active-subscription set, so the two sides of a subscription are
/// always updated together. No operation holds the lock across a sink call
/// or an await point.
pub struct SubscriptionRegistry {
    auth: Arc<dyn Authenticator>,
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create a registry that resolves identities through `auth`
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self {
            auth,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Look up the credential record for `ident`
    ///
    /// `None` means the identity is unknown.
    pub async fn get_auth_key(&self, ident: &str) -> Option<AuthKey> {
        self.auth.get_auth_key(ident).await
    }

    /// Add a connection to the connection set
    pub fn attach(&self, conn: Arc<ConnectionHandle>) {
        let mut state = self.state.lock();
        state.connections.insert(conn.id(), conn);
        metrics::set_connections(state.connections.len());
    }

    /// Remove a connection from the connection set
    ///
    /// The caller is expected to have unsubscribed every active channel first.
    pub fn detach(&self, id: u64) -> Option<Arc<ConnectionHandle>> {
        let mut state = self.state.lock();
        let removed = state.connections.remove(&id);
        metrics::set_connections(state.connections.len());
        removed
    }

    pub fn is_attached(&self, id: u64) -> bool {
        self.state.lock().connections.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Subscribe a connection to a channel
    ///
    /// Not idempotent: subscribing twice puts the connection in the list twice
    /// and it receives every message on the channel twice until it
    /// unsubscribes the same number of times.
    pub fn subscribe(&self, conn: &Arc<ConnectionHandle>, channel: &str) {
        metrics::subscription_added(conn.ak(), channel);

        let mut state = self.state.lock();
        let subscribers = state.channels.entry(channel.to_owned()).or_default();
        subscribers.push(Arc::clone(conn));
        conn.add_subscription(channel);

        tracing::debug!(
            session_id = conn.id(),
            ident = conn.ak(),
            chan = channel,
            subscribers = subscribers.len(),
            "Subscribed"
        );
    }

    /// Unsubscribe a connection from a channel
    ///
    /// Removes the channel from the connection's active set and one occurrence
    /// of the connection from the channel's list. Either part may be absent,
    /// in which case it is skipped. The subscription gauge is decremented in
    /// every case.
    pub fn unsubscribe(&self, conn: &ConnectionHandle, channel: &str) {
        {
            let mut state = self.state.lock();
            conn.remove_subscription(channel);
            if let Some(subscribers) = state.channels.get_mut(channel) {
                if let Some(pos) = subscribers.iter().position(|c| c.id() == conn.id()) {
                    subscribers.remove(pos);
                }
            }
        }

        metrics::subscription_removed(conn.ak(), channel);

        tracing::debug!(
            session_id = conn.id(),
            ident = conn.ak(),
            chan = channel,
            "Unsubscribed"
        );
    }

    /// Remove every list entry for `conn`, duplicates included
    ///
    /// Used when a connection goes away. The subscription gauge is decremented
    /// once per removed entry. Returns the number of entries removed.
    pub fn unsubscribe_all(&self, conn: &ConnectionHandle) -> usize {
        let mut removed: Vec<(String, usize)> = Vec::new();
        {
            let mut state = self.state.lock();
            conn.clear_subscriptions();
            for (channel, subscribers) in state.channels.iter_mut() {
                let before = subscribers.len();
                subscribers.retain(|c| c.id() != conn.id());
                if subscribers.len() < before {
                    removed.push((channel.clone(), before - subscribers.len()));
                }
            }
        }

        let mut total = 0;
        for (channel, count) in &removed {
            for _ in 0..*count {
                metrics::subscription_removed(conn.ak(), channel);
            }
            total += count;
        }

        tracing::debug!(
            session_id = conn.id(),
            ident = conn.ak(),
            channels = removed.len(),
            entries = total,
            "Unsubscribed from all channels"
        );

        total
    }

    /// Fan out `payload` from `source` to every subscriber of `channel`
    ///
    /// Delivery is fire-and-forget. A destination that rejects the message, or
    /// whose sink panics, is logged and skipped; the remaining destinations
    /// still receive it. Returns the number of destinations that accepted the
    /// message.
    pub fn publish(&self, source: &ConnectionHandle, channel: &str, payload: Bytes) -> usize {
        let size = payload.len();
        metrics::record_publish(source.ak(), channel, size);

        tracing::trace!(
            session_id = source.id(),
            ident = source.ak(),
            chan = channel,
            size = size,
            "Publish received"
        );

        let destinations = self
            .state
            .lock()
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for dest in &destinations {
            metrics::send_buffer_filled(dest.ak(), size);

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                dest.publish(source.ak(), channel, payload.clone())
            }));

            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::debug!(
                        session_id = dest.id(),
                        ident = dest.ak(),
                        chan = channel,
                        error = %e,
                        "Delivery failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = dest.id(),
                        ident = dest.ak(),
                        chan = channel,
                        "Destination panicked during delivery"
                    );
                }
            }
        }

        delivered
    }

    /// Number of list entries for `channel` (duplicates included)
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// IDs of the connections in `channel`'s list, in delivery order
    pub fn subscribers(&self, channel: &str) -> Vec<u64> {
        self.state
            .lock()
            .channels
            .get(channel)
            .map(|subs| subs.iter().map(|c| c.id()).collect())
            .unwrap_or_default()
    }

    /// Number of channels ever referenced by a subscribe
    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Release the authenticator
    pub async fn close(&self) {
        self.auth.close().await;
    }
}
