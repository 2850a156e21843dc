//! Consumer side: dedup, handler invocation and broker acknowledgement.
//!
//! - [`HandlerRegistry`] maps event names to application handlers
//! - [`ConsumerPipeline`] consumes one envelope idempotently through the inbox
//! - [`Consumer`] pulls deliveries from a [`Subscriber`] and acks or nacks them
//! - [`ConsumerThread`] runs a consumer in the background

mod pipeline;
mod registry;
mod thread;

use std::time::Duration;

use tracing::warn;

use crate::bus::Subscriber;
use crate::config::OutboxConfig;
use crate::error::ConsumeError;
use crate::store::Store;

pub use pipeline::{content_hash, ConsumeOutcome, ConsumerPipeline};
pub use registry::{Handler, HandlerRegistry};
pub use thread::ConsumerThread;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub retried: usize,
    pub exhausted: usize,
    /// Deliveries nacked because of a store or broker error.
    pub errors: usize,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &ConsumeOutcome) {
        match outcome {
            ConsumeOutcome::Processed => self.processed += 1,
            ConsumeOutcome::Duplicate => self.duplicates += 1,
            ConsumeOutcome::Retry { .. } => self.retried += 1,
            ConsumeOutcome::Exhausted { .. } => self.exhausted += 1,
        }
    }
}

/// Bridges a [`Subscriber`] and a [`ConsumerPipeline`].
pub struct Consumer<S: Store> {
    pipeline: ConsumerPipeline<S>,
    poll_timeout: Duration,
    stats: ConsumerStats,
}

impl<S: Store> Consumer<S> {
    pub fn new(pipeline: ConsumerPipeline<S>) -> Self {
        Self::from_config(pipeline, &OutboxConfig::default())
    }

    pub fn from_config(pipeline: ConsumerPipeline<S>, config: &OutboxConfig) -> Self {
        Self {
            pipeline,
            poll_timeout: config.consumer.poll_timeout(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn pipeline(&self) -> &ConsumerPipeline<S> {
        &self.pipeline
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Wait up to the poll timeout for one delivery and consume it.
    ///
    /// Processed, duplicate and exhausted deliveries are acked. A handler
    /// failure is nacked with the policy's delay. A store error is nacked with
    /// a backoff based on the redelivery count and returned.
    pub fn poll_once<Sub>(&mut self, subscriber: &Sub) -> Result<Option<ConsumeOutcome>, ConsumeError>
    where
        Sub: Subscriber + ?Sized,
    {
        let Some(delivery) = subscriber.poll(self.poll_timeout)? else {
            return Ok(None);
        };
        self.stats.received += 1;

        match self.pipeline.on_message(&delivery.envelope) {
            Ok(outcome) => {
                match &outcome {
                    ConsumeOutcome::Retry { delay } => {
                        subscriber.nack(delivery.delivery_tag, "handler failed", *delay)?
                    }
                    _ => subscriber.ack(delivery.delivery_tag)?,
                }
                self.stats.record(&outcome);
                Ok(Some(outcome))
            }
            Err(err) => {
                self.stats.errors += 1;
                let delay = self.pipeline.policy().next_delay(delivery.redelivered);
                warn!(
                    id = %delivery.envelope.id,
                    name = %delivery.envelope.name,
                    redelivered = delivery.redelivered,
                    error = %err,
                    "could not consume delivery, requeued"
                );
                subscriber.nack(delivery.delivery_tag, &err.to_string(), delay)?;
                Err(err)
            }
        }
    }
}
