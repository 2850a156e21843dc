//! Broker abstractions
//!
//! The outbox only needs a narrow view of the message broker: publish an
//! envelope under a routing key and learn whether the broker took it; pull
//! deliveries and ack or nack them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  publish(envelope)  ┌──────────────┐  poll/ack/nack  ┌──────────────┐
//! │  Dispatcher  │ ──────────────────► │    Broker    │ ──────────────► │   Consumer   │
//! │ (Publisher)  │                     │              │                 │ (Subscriber) │
//! └──────────────┘                     └──────────────┘                 └──────────────┘
//!                                        │         │
//!                                        ▼         ▼
//!                              InMemoryBroker   Kafka / NATS / RabbitMQ
//!                                (included)         (external)
//! ```
//!
//! Delivery is at least once and unordered across routing keys; the inbox on
//! the consuming side absorbs duplicates.

#[cfg(feature = "emitter")]
mod emitter;
mod envelope;
mod in_memory_queue;
mod publisher;
mod subscriber;

#[cfg(feature = "emitter")]
pub use emitter::EmitterPublisher;
pub use envelope::Envelope;
pub use in_memory_queue::{InMemoryBroker, InMemorySubscription};
pub use publisher::{PublishError, Publisher};
pub use subscriber::{Delivery, SubscribeError, Subscriber};
