//! Dispatcher - moves committed outbox rows to the broker.
//!
//! One cycle fetches a bounded batch of dispatchable rows, leases each one
//! with a compare-and-swap on `status_version`, publishes it and records the
//! outcome. A row whose status update is lost after a successful publish is
//! published again once its lease runs out, so delivery is at least once.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use sourced_outbox::bus::InMemoryBroker;
//! use sourced_outbox::{Dispatcher, MemoryStore, PendingEvents, TransactionCoordinator};
//!
//! let store = Arc::new(MemoryStore::new());
//! let broker = InMemoryBroker::new();
//!
//! let mut events = PendingEvents::new();
//! events.publish_raw("OrderCreated", br#"{"order_id":"o-1"}"#.to_vec());
//! TransactionCoordinator::new(store.clone())
//!     .execute_with(events, |_, _| Ok::<_, sourced_outbox::StoreError>(()))
//!     .unwrap();
//!
//! let mut dispatcher = Dispatcher::new(store, broker.clone()).with_worker_id("doc");
//! let report = dispatcher.run_cycle().unwrap();
//!
//! assert_eq!(report.published, 1);
//! assert_eq!(broker.names(), vec!["OrderCreated"]);
//! ```

mod attempt;
mod thread;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, warn};

use crate::bus::{Envelope, Publisher};
use crate::config::OutboxConfig;
use crate::error::StoreError;
use crate::message::{MessageId, OutboxChange, OutboxMessage};
use crate::retry::{ExhaustedHook, RetryPolicy};
use crate::store::{OutboxFilter, Store};

pub use attempt::DispatchAttempt;
pub use thread::DispatcherThread;

use attempt::AttemptLog;

/// What happened to one row in a cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published,
    /// Publish failed; the row is retried after `retry_in`.
    Failed { retries: u32, retry_in: Duration },
    /// Publish failed and the row used up its attempts.
    Exhausted { retries: u32 },
    /// Another dispatcher claimed or finished the row first.
    Conflict,
    /// Publish went through (or failed) but the row could not be updated; the
    /// lease expires and the row is picked up again.
    StatusUpdateFailed,
}

/// Counts for a single cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rows taken into the batch. Rows still backing off count as `deferred`.
    pub fetched: usize,
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub conflicts: usize,
    pub deferred: usize,
    pub status_update_errors: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        if *outcome != DispatchOutcome::Conflict {
            self.claimed += 1;
        }
        match outcome {
            DispatchOutcome::Published => self.published += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Exhausted { .. } => self.exhausted += 1,
            DispatchOutcome::Conflict => self.conflicts += 1,
            DispatchOutcome::StatusUpdateFailed => self.status_update_errors += 1,
        }
    }

    /// Every publish attempted this cycle failed.
    pub fn only_failures(&self) -> bool {
        self.published == 0 && self.failed + self.exhausted > 0
    }
}

/// Running totals across cycles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub cycles: usize,
    pub published: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub conflicts: usize,
    pub status_update_errors: usize,
    /// Cycles aborted by a store error.
    pub store_errors: usize,
}

impl DispatcherStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.published += report.published;
        self.failed += report.failed;
        self.exhausted += report.exhausted;
        self.conflicts += report.conflicts;
        self.status_update_errors += report.status_update_errors;
    }
}

/// Publishes pending outbox rows.
///
/// Construct with [`Dispatcher::new`] or [`Dispatcher::from_config`], tune
/// with the `with_*` setters, then either call [`run_cycle`](Self::run_cycle)
/// yourself or hand the dispatcher to a [`DispatcherThread`].
pub struct Dispatcher<S, P> {
    store: Arc<S>,
    publisher: P,
    worker_id: String,
    batch_size: usize,
    lease: Duration,
    retention: Duration,
    policy: RetryPolicy,
    attempts: AttemptLog,
    on_exhausted: Option<ExhaustedHook<OutboxMessage>>,
    stats: DispatcherStats,
}

impl<S: Store, P: Publisher> Dispatcher<S, P> {
    pub fn new(store: Arc<S>, publisher: P) -> Self {
        Self::from_config(store, publisher, &OutboxConfig::default())
    }

    pub fn from_config(store: Arc<S>, publisher: P, config: &OutboxConfig) -> Self {
        Self {
            store,
            publisher,
            worker_id: config.dispatcher.worker_id.clone(),
            batch_size: config.dispatcher.batch_size,
            lease: config.dispatcher.lease(),
            retention: config.retention.succeeded_outbox(),
            policy: RetryPolicy::from_config(&config.retry),
            attempts: AttemptLog::default(),
            on_exhausted: None,
            stats: DispatcherStats::default(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// How long published rows are kept before the collector may delete them.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Called with the row each time a publish is exhausted.
    pub fn on_exhausted<F>(mut self, hook: F) -> Self
    where
        F: Fn(&OutboxMessage) + Send + Sync + 'static,
    {
        self.on_exhausted = Some(Arc::new(hook));
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Backoff entry of a row this dispatcher failed to publish.
    pub fn pending_attempt(&self, id: &MessageId) -> Option<&DispatchAttempt> {
        self.attempts.get(id)
    }

    /// Rows currently held back by backoff.
    pub fn deferred_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn run_cycle(&mut self) -> Result<CycleReport, StoreError> {
        self.run_cycle_at(SystemTime::now())
    }

    /// Run one cycle treating `now` as the current time.
    pub fn run_cycle_at(&mut self, now: SystemTime) -> Result<CycleReport, StoreError> {
        match self.cycle(now) {
            Ok(report) => {
                self.stats.record(&report);
                Ok(report)
            }
            Err(err) => {
                self.stats.cycles += 1;
                self.stats.store_errors += 1;
                Err(err)
            }
        }
    }

    fn cycle(&mut self, now: SystemTime) -> Result<CycleReport, StoreError> {
        self.attempts.prune(now);

        let filter = OutboxFilter::pending(self.policy.max_retries(), now);
        // Rows still backing off come back from the store too; read past
        // them so they never take the place of newer rows in the batch.
        let limit = self.batch_size.saturating_add(self.attempts.len());
        let candidates = self.store.query_pending_outbox(&filter, limit)?;
        let mut report = CycleReport::default();

        for message in candidates {
            if report.fetched == self.batch_size {
                break;
            }
            if self.attempts.is_deferred(&message.id, now) {
                report.deferred += 1;
                continue;
            }
            report.fetched += 1;
            let outcome = self.dispatch(message, now)?;
            report.record(&outcome);
        }

        if report.fetched > 0 {
            debug!(
                worker_id = %self.worker_id,
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                conflicts = report.conflicts,
                "dispatch cycle finished"
            );
        }
        Ok(report)
    }

    fn dispatch(
        &mut self,
        message: OutboxMessage,
        now: SystemTime,
    ) -> Result<DispatchOutcome, StoreError> {
        let id = message.id;
        let claim = OutboxChange::Claim {
            worker_id: self.worker_id.clone(),
            now,
            until: now + self.lease,
        };
        let claimed = match self.store.update_outbox(id, message.status_version, claim) {
            Ok(row) => row,
            Err(err @ StoreError::VersionConflict { .. })
            | Err(err @ StoreError::InvalidTransition { .. }) => {
                debug!(worker_id = %self.worker_id, message_id = %id, error = %err, "row taken by another dispatcher");
                return Ok(DispatchOutcome::Conflict);
            }
            Err(err) => return Err(err),
        };

        match self.publisher.publish(Envelope::from(&claimed)) {
            Ok(()) => {
                let change = OutboxChange::Succeed {
                    expires_at: now + self.retention,
                };
                if let Err(err) = self.store.update_outbox(id, claimed.status_version, change) {
                    warn!(
                        worker_id = %self.worker_id,
                        message_id = %id,
                        error = %err,
                        "published but could not mark succeeded, will publish again after lease"
                    );
                    return Ok(DispatchOutcome::StatusUpdateFailed);
                }
                self.attempts.clear(&id);
                debug!(worker_id = %self.worker_id, message_id = %id, name = %claimed.name, "published");
                Ok(DispatchOutcome::Published)
            }
            Err(publish_err) => self.record_failure(&claimed, publish_err.to_string(), now),
        }
    }

    fn record_failure(
        &mut self,
        claimed: &OutboxMessage,
        error: String,
        now: SystemTime,
    ) -> Result<DispatchOutcome, StoreError> {
        let id = claimed.id;
        let change = OutboxChange::Fail {
            error: error.clone(),
        };
        let failed = match self.store.update_outbox(id, claimed.status_version, change) {
            Ok(row) => row,
            Err(err) => {
                warn!(
                    worker_id = %self.worker_id,
                    message_id = %id,
                    error = %err,
                    "could not record publish failure"
                );
                return Ok(DispatchOutcome::StatusUpdateFailed);
            }
        };

        if self.policy.is_exhausted(failed.retries) {
            self.attempts.clear(&id);
            error!(
                worker_id = %self.worker_id,
                message_id = %id,
                name = %failed.name,
                retries = failed.retries,
                error = %error,
                "publish exhausted, operator action required"
            );
            if let Some(hook) = &self.on_exhausted {
                hook(&failed);
            }
            return Ok(DispatchOutcome::Exhausted {
                retries: failed.retries,
            });
        }

        let retry_in = self.policy.next_delay(failed.retries);
        warn!(
            worker_id = %self.worker_id,
            message_id = %id,
            name = %failed.name,
            retries = failed.retries,
            retry_in_ms = retry_in.as_millis() as u64,
            error = %error,
            "publish failed"
        );
        self.attempts.defer(DispatchAttempt {
            id,
            attempt: failed.retries,
            last_error: error,
            not_before: now + retry_in,
        });
        Ok(DispatchOutcome::Failed {
            retries: failed.retries,
            retry_in,
        })
    }
}
