//! Background thread pulling deliveries until stopped.

use std::io;

use tracing::{info, warn};

use super::{Consumer, ConsumerStats};
use crate::bus::Subscriber;
use crate::error::ConsumeError;
use crate::store::Store;
use crate::worker::BackgroundWorker;

/// A consumer on its own thread.
///
/// Each iteration blocks in `Subscriber::poll` for at most the consumer's
/// poll timeout, so a stop request is noticed within one timeout. Broker
/// errors back off with the retry policy; a failing message never stops the
/// loop.
pub struct ConsumerThread {
    worker: BackgroundWorker<ConsumerStats>,
}

impl ConsumerThread {
    pub fn spawn<S, Sub>(
        name: impl Into<String>,
        consumer: Consumer<S>,
        subscriber: Sub,
    ) -> io::Result<Self>
    where
        S: Store + 'static,
        Sub: Subscriber + 'static,
    {
        let name = name.into();
        let thread_name = format!("outbox-consumer-{}", name);
        let worker = BackgroundWorker::spawn(thread_name, move |stop| {
            let mut consumer = consumer;
            let mut broker_failures: u32 = 0;
            info!(consumer = %name, "consumer started");

            while !stop.is_stopped() {
                match consumer.poll_once(&subscriber) {
                    Ok(_) => broker_failures = 0,
                    Err(ConsumeError::Broker(err)) => {
                        let wait = consumer.pipeline().policy().next_delay(broker_failures);
                        broker_failures = broker_failures.saturating_add(1);
                        warn!(
                            consumer = %name,
                            error = %err,
                            retry_in_ms = wait.as_millis() as u64,
                            "broker error"
                        );
                        if stop.wait(wait) {
                            break;
                        }
                    }
                    // already logged and nacked by poll_once
                    Err(_) => {}
                }
            }

            let stats = consumer.stats().clone();
            info!(
                consumer = %name,
                received = stats.received,
                processed = stats.processed,
                duplicates = stats.duplicates,
                "consumer stopped"
            );
            stats
        })?;

        Ok(Self { worker })
    }

    /// Signal the thread to stop and wait for it. Returns its statistics.
    pub fn stop(self) -> ConsumerStats {
        self.worker.stop()
    }

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
    use crate::bus::{Envelope, InMemoryBroker, Publisher};
    use crate::consumer::{ConsumerPipeline, HandlerRegistry};
    use crate::error::HandlerError;
    use crate::store::{MemoryStore, MemoryTransaction};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn consumes_until_stopped() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "Ping",
                |tx: &mut MemoryTransaction, envelope: &Envelope| -> Result<(), HandlerError> {
                    tx.put("pings", &envelope.id, &true)?;
                    Ok(())
                },
            )
            .unwrap();
        let consumer = Consumer::new(ConsumerPipeline::new(store.clone(), registry))
            .with_poll_timeout(Duration::from_millis(10));
        let thread = ConsumerThread::spawn("pings", consumer, broker.subscribe_all()).unwrap();

        for i in 0..3 {
            broker
                .publish(Envelope::new(format!("p-{}", i), "Ping", b"{}".to_vec()))
                .unwrap();
        }

        let started = Instant::now();
        while store.table_len("pings").unwrap() < 3 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }

        let stats = thread.stop();
        assert_eq!(stats.processed, 3);
        assert_eq!(store.table_len("pings").unwrap(), 3);
    }
}
