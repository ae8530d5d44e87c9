//! Delivery error types
//!
//! Returned by a [`MessageSink`](super::MessageSink) that could not accept a
//! message. The registry logs these and moves on to the next destination.

/// Error type for per-destination delivery
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The destination's outbound queue is full; the message was dropped
    #[error("outbound queue full")]
    QueueFull,
    /// The destination connection is gone
    #[error("connection closed")]
    Closed,
}
