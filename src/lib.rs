//! hpfeeds broker
//!
//! A publish/subscribe broker for the hpfeeds feed protocol. Clients connect,
//! authenticate against an [`Authenticator`], subscribe to channels, and every
//! message published to a channel is fanned out to that channel's current
//! subscribers.
//!
//! ```text
//!   TcpListener ──accept──► Connection (session task)
//!                               │  subscribe / unsubscribe / publish
//!                               ▼
//!                     Arc<SubscriptionRegistry>
//!                     channel ─► [ConnectionHandle, ...]
//!                               │
//!                               └──► MessageSink::deliver() ──► outbound queue ──► TCP
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hpfeeds_broker::{AuthKey, Broker, BrokerConfig, MemoryAuthenticator};
//!
//! # async fn run() -> hpfeeds_broker::Result<()> {
//! let auth = MemoryAuthenticator::new();
//! auth.insert(AuthKey::new("sensor", "owner", "s3cret").publish(["events"]));
//!
//! let config = BrokerConfig::from_specs(Some("127.0.0.1:10000"), None)?;
//! let broker = Arc::new(Broker::new(config, Arc::new(auth)));
//!
//! let handle = broker.clone();
//! tokio::spawn(async move { handle.serve().await });
//!
//! let addr = broker.started().await?;
//! println!("listening on {addr}");
//! broker.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

pub use auth::{AuthKey, Authenticator, MemoryAuthenticator};
pub use error::{BrokerError, Result};
pub use registry::{ConnectionHandle, DeliveryError, MessageSink, SubscriptionRegistry};
pub use server::{Broker, BrokerConfig, BrokerState, Endpoint};
