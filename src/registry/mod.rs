//! Subscription registry for pub/sub routing
//!
//! The registry owns the channel → subscriber routing table and the set of
//! attached connections. Sessions call into it as protocol events arrive;
//! it never touches sockets itself.
//!
//! # Architecture
//!
//! ```text
//!                     Arc<SubscriptionRegistry>
//!                 ┌───────────────────────────────┐
//!                 │ Mutex<RegistryState {         │
//!                 │   channels: HashMap<Chan,     │
//!                 │     Vec<Arc<ConnectionHandle>>│
//!                 │   >,                          │
//!                 │   connections: HashMap<Id, ..>│
//!                 │ }>                            │
//!                 └───────────────┬───────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Publisher]            [Subscriber]            [Subscriber]
//!    publish()              sink.deliver()          sink.deliver()
//!         │                       │                       │
//!         └──► snapshot list ──► deliver() ──► outbound queue ──► TCP
//! ```
//!
//! # Fan-out
//!
//! `publish` copies the subscriber list for the channel while holding the lock
//! and invokes each destination's sink after releasing it. Payloads are
//! `bytes::Bytes`, so every destination shares the same allocation.

pub mod entry;
pub mod error;
pub mod store;

pub use entry::{ConnectionHandle, MessageSink};
pub use error::DeliveryError;
pub use store::SubscriptionRegistry;
