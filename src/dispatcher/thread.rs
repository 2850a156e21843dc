//! Background thread running dispatch cycles until stopped.

use std::io;
use std::time::Duration;

use tracing::{info, warn};

use super::{Dispatcher, DispatcherStats};
use crate::bus::Publisher;
use crate::store::Store;
use crate::worker::BackgroundWorker;

/// A dispatcher on its own thread.
///
/// After a cycle that published a full batch it goes again immediately. After
/// a cycle in which every publish failed, or a store error, it backs off with
/// the retry policy. Otherwise it sleeps for `poll_interval`. Stopping is
/// prompt: every sleep is a wait on the stop channel.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use sourced_outbox::bus::InMemoryBroker;
/// use sourced_outbox::{Dispatcher, DispatcherThread, MemoryStore};
///
/// let store = Arc::new(MemoryStore::new());
/// let dispatcher = Dispatcher::new(store, InMemoryBroker::new());
///
/// let thread = DispatcherThread::spawn(dispatcher, Duration::from_millis(10)).unwrap();
/// // ... commit business transactions ...
/// let stats = thread.stop();
/// assert_eq!(stats.published, 0);
/// ```
pub struct DispatcherThread {
    worker: BackgroundWorker<DispatcherStats>,
}

impl DispatcherThread {
    pub fn spawn<S, P>(dispatcher: Dispatcher<S, P>, poll_interval: Duration) -> io::Result<Self>
    where
        S: Store + 'static,
        P: Publisher + 'static,
    {
        let name = format!("outbox-dispatcher-{}", dispatcher.worker_id());
        let worker = BackgroundWorker::spawn(name, move |stop| {
            let mut dispatcher = dispatcher;
            let batch_size = dispatcher.batch_size();
            let mut failed_cycles: u32 = 0;
            info!(worker_id = %dispatcher.worker_id(), "dispatcher started");

            loop {
                let wait = match dispatcher.run_cycle() {
                    Ok(report) if report.published > 0 && report.fetched >= batch_size => {
                        failed_cycles = 0;
                        Duration::ZERO
                    }
                    Ok(report) if report.only_failures() => {
                        let wait = dispatcher.policy().next_delay(failed_cycles);
                        failed_cycles = failed_cycles.saturating_add(1);
                        wait
                    }
                    Ok(_) => {
                        failed_cycles = 0;
                        poll_interval
                    }
                    Err(err) => {
                        let wait = dispatcher.policy().next_delay(failed_cycles);
                        failed_cycles = failed_cycles.saturating_add(1);
                        warn!(
                            worker_id = %dispatcher.worker_id(),
                            error = %err,
                            retry_in_ms = wait.as_millis() as u64,
                            "dispatch cycle failed"
                        );
                        wait
                    }
                };

                let stopped = if wait.is_zero() {
                    stop.is_stopped()
                } else {
                    stop.wait(wait)
                };
                if stopped {
                    break;
                }
            }

            let stats = dispatcher.stats().clone();
            info!(
                worker_id = %dispatcher.worker_id(),
                cycles = stats.cycles,
                published = stats.published,
                failed = stats.failed,
                "dispatcher stopped"
            );
            stats
        })?;

        Ok(Self { worker })
    }

    /// Signal the thread to stop and wait for it. Returns its statistics.
    pub fn stop(self) -> DispatcherStats {
        self.worker.stop()
    }

    /// Signal the thread to stop without waiting.
    pub fn signal_stop(&self) {
        self.worker.signal_stop();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBroker;
    use crate::message::OutboxMessage;
    use crate::retry::RetryPolicy;
    use crate::store::{MemoryStore, Transaction};
    use std::sync::Arc;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn drains_outbox_in_background() {
        let store = Arc::new(MemoryStore::new());
        let broker = InMemoryBroker::new();
        let dispatcher = Dispatcher::new(store.clone(), broker.clone())
            .with_worker_id("bg")
            .with_batch_size(2);
        let thread = DispatcherThread::spawn(dispatcher, Duration::from_millis(5)).unwrap();

        let mut tx = store.begin().unwrap();
        let rows = (0..5)
            .map(|i| OutboxMessage::new(format!("E{}", i), b"{}".to_vec()))
            .collect();
        tx.insert_outbox(rows).unwrap();
        tx.commit().unwrap();

        assert!(wait_until(Duration::from_secs(5), || broker.len() == 5));
        let stats = thread.stop();
        assert_eq!(stats.published, 5);
    }

    #[test]
    fn survives_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let broker = InMemoryBroker::new();
        store.set_unavailable(true);

        let dispatcher = Dispatcher::new(store.clone(), broker.clone())
            .with_retry_policy(RetryPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(10),
                5,
            ));
        let thread = DispatcherThread::spawn(dispatcher, Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        store.set_unavailable(false);
        let mut tx = store.begin().unwrap();
        tx.insert_outbox(vec![OutboxMessage::new("Late", b"{}".to_vec())])
            .unwrap();
        tx.commit().unwrap();

        assert!(wait_until(Duration::from_secs(5), || broker.len() == 1));
        let stats = thread.stop();
        assert!(stats.store_errors > 0);
    }
}
