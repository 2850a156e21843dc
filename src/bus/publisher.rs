//! Core publisher trait for the broker side of the outbox.

use std::error::Error;

use thiserror::Error;

use super::Envelope;

/// Error type for publishing to a broker.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Connection to the broker failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The broker rejected the message
    #[error("message rejected: {0}")]
    Rejected(String),
    /// Timeout waiting for acknowledgment
    #[error("publish timeout")]
    Timeout,
    /// Other error
    #[error("broker error: {0}")]
    Other(#[source] Box<dyn Error + Send + Sync>),
}

/// Trait for publishing envelopes to a message broker.
///
/// `publish` returns once the broker has acknowledged the message. Adapters
/// for remote brokers bound that wait themselves and report
/// [`PublishError::Timeout`] instead of blocking the dispatcher.
///
/// Implementations might include:
/// - `InMemoryBroker` - For testing and single-process scenarios
/// - `EmitterPublisher` - In-process callbacks (requires the `emitter` feature)
/// - Kafka, NATS or RabbitMQ adapters living outside this crate
pub trait Publisher: Send + Sync {
    /// Publish a single envelope, routed by `envelope.name`.
    fn publish(&self, envelope: Envelope) -> Result<(), PublishError>;
}

impl<P: Publisher + ?Sized> Publisher for std::sync::Arc<P> {
    fn publish(&self, envelope: Envelope) -> Result<(), PublishError> {
        (**self).publish(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Flaky {
        accepted: Mutex<Vec<String>>,
        reject: &'static str,
    }

    impl Publisher for Flaky {
        fn publish(&self, envelope: Envelope) -> Result<(), PublishError> {
            if envelope.name == self.reject {
                return Err(PublishError::Rejected(envelope.name));
            }
            self.accepted.lock().unwrap().push(envelope.name);
            Ok(())
        }
    }

    #[test]
    fn shared_publisher_forwards_to_inner() {
        let publisher = std::sync::Arc::new(Flaky {
            accepted: Mutex::new(Vec::new()),
            reject: "Bad",
        });
        let shared: &dyn Publisher = &publisher;

        shared.publish(Envelope::with_string_payload("1", "Good", "{}")).unwrap();
        let result = shared.publish(Envelope::with_string_payload("2", "Bad", "{}"));

        assert!(matches!(result, Err(PublishError::Rejected(name)) if name == "Bad"));
        assert_eq!(*publisher.accepted.lock().unwrap(), vec!["Good".to_string()]);
    }

    #[test]
    fn error_display() {
        assert_eq!(PublishError::Timeout.to_string(), "publish timeout");
        assert_eq!(
            PublishError::ConnectionFailed("refused".into()).to_string(),
            "connection failed: refused"
        );
    }
}
