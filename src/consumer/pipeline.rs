use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::HandlerRegistry;
use crate::bus::Envelope;
use crate::config::{DedupStrategy, OutboxConfig};
use crate::error::{ConsumeError, HandlerError, StoreError};
use crate::message::InboxMessage;
use crate::retry::{ExhaustedHook, RetryPolicy};
use crate::store::{Store, Transaction};

/// Result of consuming one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The handler ran and its effects committed with the inbox row.
    Processed,
    /// The key was already consumed; the handler was not invoked.
    Duplicate,
    /// The handler failed; redeliver after `delay`.
    Retry { delay: Duration },
    /// The key used up its attempts and is left for an operator.
    Exhausted { retries: u32 },
}

impl ConsumeOutcome {
    /// Whether the delivery should be acked.
    pub fn is_ack(&self) -> bool {
        !matches!(self, ConsumeOutcome::Retry { .. })
    }
}

enum Step {
    Done(ConsumeOutcome),
    HandlerFailed(HandlerError),
}

/// SHA-256 over the event name and content, hex encoded.
pub fn content_hash(name: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Idempotent consumption of deliveries.
///
/// Every delivery is tracked by a dedup key in the inbox table. The handler
/// runs inside the store's unit of work and the inbox row is marked
/// Succeeded in the same commit, so a key's effects are applied at most once
/// no matter how often the broker redelivers it.
///
/// Cloning is cheap; clones share the handlers and the store.
pub struct ConsumerPipeline<S: Store> {
    store: Arc<S>,
    handlers: Arc<HandlerRegistry<S::Transaction>>,
    policy: RetryPolicy,
    dedup: DedupStrategy,
    dedup_window: Duration,
    conflict_retries: u32,
    on_exhausted: Option<ExhaustedHook<InboxMessage>>,
}

impl<S: Store> Clone for ConsumerPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            handlers: Arc::clone(&self.handlers),
            policy: self.policy.clone(),
            dedup: self.dedup,
            dedup_window: self.dedup_window,
            conflict_retries: self.conflict_retries,
            on_exhausted: self.on_exhausted.clone(),
        }
    }
}

impl<S: Store> ConsumerPipeline<S> {
    pub fn new(store: Arc<S>, handlers: HandlerRegistry<S::Transaction>) -> Self {
        Self::from_config(store, handlers, &OutboxConfig::default())
    }

    pub fn from_config(
        store: Arc<S>,
        handlers: HandlerRegistry<S::Transaction>,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            store,
            handlers: Arc::new(handlers),
            policy: RetryPolicy::from_config(&config.retry),
            dedup: config.consumer.dedup,
            dedup_window: config.retention.succeeded_inbox(),
            conflict_retries: config.consumer.conflict_retries,
            on_exhausted: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupStrategy) -> Self {
        self.dedup = dedup;
        self
    }

    /// How long a consumed key keeps absorbing duplicates.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Called with the inbox row each time a key is exhausted.
    pub fn on_exhausted<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InboxMessage) + Send + Sync + 'static,
    {
        self.on_exhausted = Some(Arc::new(hook));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn handlers(&self) -> &HandlerRegistry<S::Transaction> {
        &self.handlers
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Dedup key of a delivery.
    ///
    /// Envelopes without an id fall back to the content hash.
    pub fn dedup_key(&self, envelope: &Envelope) -> String {
        match self.dedup {
            DedupStrategy::MessageId if !envelope.id.is_empty() => envelope.id.clone(),
            _ => content_hash(&envelope.name, &envelope.content),
        }
    }

    /// Consume one delivery.
    pub fn on_message(&self, envelope: &Envelope) -> Result<ConsumeOutcome, ConsumeError> {
        let key = self.dedup_key(envelope);
        let mut conflicts = 0;

        loop {
            let result = self
                .ensure_received(&key, envelope)
                .and_then(|()| self.process(&key, envelope))
                .and_then(|step| match step {
                    Step::Done(outcome) => Ok(outcome),
                    Step::HandlerFailed(err) => self.record_failure(&key, &envelope.name, &err),
                });

            match result {
                Err(ConsumeError::Store(err)) if err.is_conflict() && conflicts < self.conflict_retries => {
                    conflicts += 1;
                    debug!(key = %key, name = %envelope.name, conflicts, "lost inbox race, retrying");
                }
                other => return other,
            }
        }
    }

    /// Run the handler again for a stored inbox message, typically after an
    /// operator requeued it.
    ///
    /// Unlike [`on_message`](Self::on_message) a handler failure is returned
    /// as [`ConsumeError::HandlerFailed`] (after being recorded on the row),
    /// and an exhausted key as [`ConsumeError::ConsumptionExhausted`].
    pub fn replay(&self, key: &str) -> Result<ConsumeOutcome, ConsumeError> {
        let row = self
            .store
            .get_inbox(key)?
            .ok_or_else(|| StoreError::NotFound(format!("inbox message {}", key)))?;
        if row.is_exhausted(self.policy.max_retries()) {
            return Err(ConsumeError::ConsumptionExhausted {
                key: key.to_string(),
                retries: row.retries,
            });
        }

        let envelope = row.to_envelope();
        info!(key = %key, name = %envelope.name, "replaying inbox message");
        match self.process(key, &envelope)? {
            Step::Done(outcome) => Ok(outcome),
            Step::HandlerFailed(source) => {
                if self.record_failure(key, &envelope.name, &source)? == ConsumeOutcome::Duplicate {
                    return Ok(ConsumeOutcome::Duplicate);
                }
                Err(ConsumeError::HandlerFailed {
                    name: envelope.name,
                    source,
                })
            }
        }
    }

    /// Insert a Scheduled inbox row on first receipt.
    fn ensure_received(&self, key: &str, envelope: &Envelope) -> Result<(), ConsumeError> {
        let mut tx = self.store.begin()?;
        if tx.find_inbox(key)?.is_some() {
            tx.rollback();
            return Ok(());
        }
        tx.save_inbox(InboxMessage::received(key, envelope))?;
        tx.commit()?;
        debug!(key = %key, name = %envelope.name, "message received");
        Ok(())
    }

    /// Invoke the handler inside a unit of work that also completes the row.
    fn process(&self, key: &str, envelope: &Envelope) -> Result<Step, ConsumeError> {
        let mut tx = self.store.begin()?;
        let Some(mut row) = tx.find_inbox(key)? else {
            tx.rollback();
            // removed underneath us; start over
            return Err(StoreError::VersionConflict {
                id: format!("inbox/{}", key),
                expected: 1,
                actual: 0,
            }
            .into());
        };

        if row.is_succeeded() {
            tx.rollback();
            debug!(key = %key, name = %envelope.name, "duplicate delivery");
            return Ok(Step::Done(ConsumeOutcome::Duplicate));
        }
        if row.is_exhausted(self.policy.max_retries()) {
            tx.rollback();
            warn!(key = %key, name = %envelope.name, retries = row.retries, "delivery of exhausted message ignored");
            return Ok(Step::Done(ConsumeOutcome::Exhausted {
                retries: row.retries,
            }));
        }

        let Some(handler) = self.handlers.get(&envelope.name) else {
            tx.rollback();
            return Ok(Step::HandlerFailed(
                format!("no handler registered for {}", envelope.name).into(),
            ));
        };

        if let Err(err) = handler.handle(&mut tx, envelope) {
            tx.rollback();
            return Ok(Step::HandlerFailed(err));
        }

        row.record_success(SystemTime::now() + self.dedup_window);
        tx.save_inbox(row)?;
        tx.commit()?;
        debug!(key = %key, name = %envelope.name, "message processed");
        Ok(Step::Done(ConsumeOutcome::Processed))
    }

    /// Record a handler failure in a fresh transaction.
    ///
    /// The row is read again first: a concurrent delivery of the same key may
    /// have completed or exhausted it since the handler's unit of work was
    /// rolled back.
    fn record_failure(
        &self,
        key: &str,
        name: &str,
        err: &HandlerError,
    ) -> Result<ConsumeOutcome, ConsumeError> {
        let mut tx = self.store.begin()?;
        let Some(mut row) = tx.find_inbox(key)? else {
            tx.rollback();
            return Err(StoreError::NotFound(format!("inbox message {}", key)).into());
        };
        if row.is_exhausted(self.policy.max_retries()) {
            tx.rollback();
            return Ok(ConsumeOutcome::Exhausted {
                retries: row.retries,
            });
        }
        if !row.record_failure(err.to_string()) {
            tx.rollback();
            debug!(key = %key, name = %name, error = %err, "failed delivery raced a successful one");
            return Ok(ConsumeOutcome::Duplicate);
        }
        let retries = row.retries;
        tx.save_inbox(row.clone())?;
        tx.commit()?;

        if self.policy.is_exhausted(retries) {
            error!(
                key = %key,
                name = %name,
                retries,
                error = %err,
                "consumption exhausted, operator action required"
            );
            if let Some(hook) = &self.on_exhausted {
                hook(&row);
            }
            return Ok(ConsumeOutcome::Exhausted { retries });
        }

        let delay = self.policy.next_delay(retries);
        warn!(
            key = %key,
            name = %name,
            retries,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "handler failed"
        );
        Ok(ConsumeOutcome::Retry { delay })
    }
}
