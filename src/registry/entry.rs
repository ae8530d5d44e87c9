//! Connection handle and sink types
//!
//! A [`ConnectionHandle`] is the registry's view of one authenticated client.
//! The session that owns the socket supplies a [`MessageSink`] through which
//! the registry pushes fanned-out messages.

use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;

use super::error::DeliveryError;

/// Destination for messages routed to a connection
///
/// Implementations must not block: `deliver` is called from inside the
/// publisher's fan-out loop. Queue the message or drop it.
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(&self, source_ak: &str, channel: &str, payload: Bytes) -> Result<(), DeliveryError>;
}

/// Broker-side representative of one client link
pub struct ConnectionHandle {
    /// Unique connection ID
    id: u64,

    /// Authenticated identity
    ak: String,

    /// Channels this connection is subscribed to. Written only by the registry.
    active_subscriptions: Mutex<HashSet<String>>,

    sink: Box<dyn MessageSink>,
}

impl ConnectionHandle {
    /// Create a handle for an authenticated connection
    pub fn new(id: u64, ak: impl Into<String>, sink: impl MessageSink) -> Self {
        Self {
            id,
            ak: ak.into(),
            active_subscriptions: Mutex::new(HashSet::new()),
            sink: Box::new(sink),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Authenticated identity of this connection
    pub fn ak(&self) -> &str {
        &self.ak
    }

    /// Snapshot of the channels this connection is subscribed to
    pub fn active_subscriptions(&self) -> HashSet<String> {
        self.active_subscriptions.lock().clone()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.active_subscriptions.lock().contains(channel)
    }

    /// Hand a message from `source_ak` to this connection's sink
    pub fn publish(&self, source_ak: &str, channel: &str, payload: Bytes) -> Result<(), DeliveryError> {
        self.sink.deliver(source_ak, channel, payload)
    }

    pub(super) fn add_subscription(&self, channel: &str) {
        self.active_subscriptions.lock().insert(channel.to_owned());
    }

    pub(super) fn remove_subscription(&self, channel: &str) -> bool {
        self.active_subscriptions.lock().remove(channel)
    }

    pub(super) fn clear_subscriptions(&self) {
        self.active_subscriptions.lock().clear();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("ak", &self.ak)
            .field("active_subscriptions", &*self.active_subscriptions.lock())
            .finish_non_exhaustive()
    }
}
