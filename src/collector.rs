//! Retention: deletes Succeeded rows whose `expires_at` has passed.
//!
//! Failed rows, exhausted or not, are never collected; they wait for an
//! operator (see [`Monitor`](crate::Monitor)).

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::error::StoreError;
use crate::store::Store;
use crate::worker::BackgroundWorker;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub outbox: usize,
    pub inbox: usize,
}

impl CollectReport {
    pub fn total(&self) -> usize {
        self.outbox + self.inbox
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub passes: usize,
    pub outbox_deleted: usize,
    pub inbox_deleted: usize,
    pub errors: usize,
}

pub struct Collector<S> {
    store: Arc<S>,
    batch: usize,
}

impl<S: Store> Collector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::from_config(store, &OutboxConfig::default())
    }

    pub fn from_config(store: Arc<S>, config: &OutboxConfig) -> Self {
        Self {
            store,
            batch: config.retention.collect_batch,
        }
    }

    /// Rows deleted per store call.
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn collect(&self) -> Result<CollectReport, StoreError> {
        self.collect_at(SystemTime::now())
    }

    /// Delete everything expired at `now`, one batch at a time.
    pub fn collect_at(&self, now: SystemTime) -> Result<CollectReport, StoreError> {
        let report = CollectReport {
            outbox: drain(self.batch, |limit| self.store.delete_expired_outbox(now, limit))?,
            inbox: drain(self.batch, |limit| self.store.delete_expired_inbox(now, limit))?,
        };
        if report.total() > 0 {
            info!(outbox = report.outbox, inbox = report.inbox, "expired messages deleted");
        }
        Ok(report)
    }
}

fn drain<F>(batch: usize, mut delete: F) -> Result<usize, StoreError>
where
    F: FnMut(usize) -> Result<usize, StoreError>,
{
    let mut total = 0;
    loop {
        let deleted = delete(batch)?;
        total += deleted;
        if deleted < batch {
            return Ok(total);
        }
    }
}

/// A collector running every `interval` until stopped.
pub struct CollectorThread {
    worker: BackgroundWorker<CollectorStats>,
}

impl CollectorThread {
    pub fn spawn<S>(collector: Collector<S>, interval: Duration) -> io::Result<Self>
    where
        S: Store + 'static,
    {
        let worker = BackgroundWorker::spawn("outbox-collector", move |stop| {
            let mut stats = CollectorStats::default();
            loop {
                stats.passes += 1;
                match collector.collect() {
                    Ok(report) => {
                        stats.outbox_deleted += report.outbox;
                        stats.inbox_deleted += report.inbox;
                    }
                    Err(err) => {
                        stats.errors += 1;
                        warn!(error = %err, "collector pass failed");
                    }
                }
                if stop.wait(interval) {
                    break;
                }
            }
            debug!(passes = stats.passes, "collector stopped");
            stats
        })?;

        Ok(Self { worker })
    }

    pub fn stop(self) -> CollectorStats {
        self.worker.stop()
    }
}
