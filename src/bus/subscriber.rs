//! Core subscriber trait for the consuming side.

use std::error::Error;
use std::time::Duration;

use thiserror::Error;

use super::Envelope;

/// Error type for consuming from a broker.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// Connection to the broker failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Ack or nack named a tag that is not in flight
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
    /// Other error
    #[error("subscriber error: {0}")]
    Other(#[source] Box<dyn Error + Send + Sync>),
}

/// One delivery of an envelope to a subscriber.
///
/// The same envelope may be delivered more than once; `delivery_tag` is unique
/// per delivery and is what gets acked or nacked.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    /// How many times this envelope was handed out before this delivery.
    pub redelivered: u32,
}

/// Trait for pulling deliveries from a message broker.
pub trait Subscriber: Send + Sync {
    /// Poll for the next delivery, blocking until one is available or timeout.
    fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, SubscribeError>;

    /// Acknowledge that a delivery has been processed.
    fn ack(&self, delivery_tag: u64) -> Result<(), SubscribeError>;

    /// Reject a delivery; the broker redelivers it after `requeue_after`.
    fn nack(&self, delivery_tag: u64, reason: &str, requeue_after: Duration)
        -> Result<(), SubscribeError>;
}
