//! In-memory broker for testing and single-process scenarios.
//!
//! This module provides a thread-safe in-memory broker that implements
//! `Publisher`, with subscriptions implementing `Subscriber`, useful for:
//! - Unit and integration testing without external dependencies
//! - Single-process applications
//! - Exercising failure paths (injected publish failures, redelivery)

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::{Delivery, Envelope, PublishError, Publisher, SubscribeError, Subscriber};

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_next: usize,
}

/// In-memory broker.
///
/// Features:
/// - Thread-safe (can be shared across threads via `Clone`)
/// - Envelopes are stored in an append-only log
/// - Each subscription tracks its own read position and routing keys
/// - Nacked deliveries come back after their requeue delay
/// - Publish failures can be injected to simulate an outage
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use sourced_outbox::bus::{Envelope, InMemoryBroker, Publisher, Subscriber};
///
/// let broker = InMemoryBroker::new();
/// let orders = broker.subscribe(&["OrderCreated"]);
///
/// broker.publish(Envelope::with_string_payload("evt-1", "OrderCreated", r#"{"id":"123"}"#)).unwrap();
/// broker.publish(Envelope::with_string_payload("evt-2", "UserCreated", "{}")).unwrap();
///
/// let delivery = orders.poll(Duration::from_millis(100)).unwrap().unwrap();
/// assert_eq!(delivery.envelope.name, "OrderCreated");
/// orders.ack(delivery.delivery_tag).unwrap();
/// assert!(orders.poll(Duration::from_millis(10)).unwrap().is_none());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    log: Arc<RwLock<Vec<Envelope>>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given routing keys, starting at the beginning of the log.
    pub fn subscribe(&self, routing_keys: &[&str]) -> InMemorySubscription {
        InMemorySubscription::new(
            self.clone(),
            Some(routing_keys.iter().map(|key| key.to_string()).collect()),
        )
    }

    /// Subscribe to every routing key.
    pub fn subscribe_all(&self) -> InMemorySubscription {
        InMemorySubscription::new(self.clone(), None)
    }

    /// Make every publish fail with `ConnectionFailed` until restored.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    /// Fail the next `count` publishes with `Rejected`.
    pub fn fail_next(&self, count: usize) {
        self.faults().fail_next = count;
    }

    /// All envelopes in the log.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.read_log().clone()
    }

    /// All routing keys in publish order.
    pub fn names(&self) -> Vec<String> {
        self.read_log().iter().map(|e| e.name.clone()).collect()
    }

    /// How many times an envelope id was published.
    pub fn count_by_id(&self, id: &str) -> usize {
        self.read_log().iter().filter(|e| e.id == id).count()
    }

    pub fn find_all_by_name(&self, name: &str) -> Vec<Envelope> {
        self.read_log()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_log().is_empty()
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_log(&self) -> std::sync::RwLockReadGuard<'_, Vec<Envelope>> {
        self.log.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Publisher for InMemoryBroker {
    fn publish(&self, envelope: Envelope) -> Result<(), PublishError> {
        {
            let mut faults = self.faults();
            if faults.unavailable {
                return Err(PublishError::ConnectionFailed(
                    "in-memory broker unavailable".into(),
                ));
            }
            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                return Err(PublishError::Rejected(format!(
                    "injected failure for {}",
                    envelope.id
                )));
            }
        }
        self.log
            .write()
            .map_err(|_| PublishError::ConnectionFailed("broker log poisoned".into()))?
            .push(envelope);
        Ok(())
    }
}

/// Acked ids kept per subscription for inspection.
const ACK_HISTORY: usize = 1024;

struct Redelivery {
    visible_at: Instant,
    envelope: Envelope,
    redelivered: u32,
}

#[derive(Default)]
struct SubscriptionState {
    position: usize,
    next_tag: u64,
    in_flight: HashMap<u64, (Envelope, u32)>,
    redeliveries: Vec<Redelivery>,
    acked: VecDeque<String>,
    acked_total: u64,
}

impl SubscriptionState {
    fn hand_out(&mut self, envelope: Envelope, redelivered: u32) -> Delivery {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.in_flight.insert(tag, (envelope.clone(), redelivered));
        Delivery {
            envelope,
            delivery_tag: tag,
            redelivered,
        }
    }

    fn record_ack(&mut self, id: String) {
        if self.acked.len() == ACK_HISTORY {
            self.acked.pop_front();
        }
        self.acked.push_back(id);
        self.acked_total += 1;
    }

    fn take_due_redelivery(&mut self, now: Instant) -> Option<Redelivery> {
        let index = self
            .redeliveries
            .iter()
            .enumerate()
            .filter(|(_, r)| r.visible_at <= now)
            .min_by_key(|(_, r)| r.visible_at)
            .map(|(index, _)| index)?;
        Some(self.redeliveries.remove(index))
    }
}

/// A subscription on an [`InMemoryBroker`] with its own position.
///
/// Cloning shares the position, so clones act as competing consumers.
#[derive(Clone)]
pub struct InMemorySubscription {
    broker: InMemoryBroker,
    routing_keys: Option<HashSet<String>>,
    state: Arc<Mutex<SubscriptionState>>,
}

impl InMemorySubscription {
    fn new(broker: InMemoryBroker, routing_keys: Option<HashSet<String>>) -> Self {
        Self {
            broker,
            routing_keys,
            state: Arc::new(Mutex::new(SubscriptionState::default())),
        }
    }

    /// Ids of the most recent acknowledged deliveries, oldest first.
    /// Only the last 1024 are kept; see [`ack_count`](Self::ack_count).
    pub fn acknowledged(&self) -> Vec<String> {
        self.lock_state().acked.iter().cloned().collect()
    }

    /// Total deliveries acked over the subscription's lifetime.
    pub fn ack_count(&self) -> u64 {
        self.lock_state().acked_total
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight.len()
    }

    /// Nacked deliveries waiting to come back.
    pub fn pending_redeliveries(&self) -> usize {
        self.lock_state().redeliveries.len()
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        self.routing_keys
            .as_ref()
            .map(|keys| keys.contains(&envelope.name))
            .unwrap_or(true)
    }

    fn lock_state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_next(&self) -> Result<Option<Delivery>, SubscribeError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SubscribeError::ConnectionFailed("subscription state poisoned".into()))?;

        if let Some(redelivery) = state.take_due_redelivery(Instant::now()) {
            return Ok(Some(
                state.hand_out(redelivery.envelope, redelivery.redelivered),
            ));
        }

        let log = self
            .broker
            .log
            .read()
            .map_err(|_| SubscribeError::ConnectionFailed("broker log poisoned".into()))?;
        while state.position < log.len() {
            let envelope = &log[state.position];
            state.position += 1;
            if self.matches(envelope) {
                let envelope = envelope.clone();
                return Ok(Some(state.hand_out(envelope, 0)));
            }
        }
        Ok(None)
    }
}

impl Subscriber for InMemorySubscription {
    fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, SubscribeError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(delivery) = self.try_next()? {
                return Ok(Some(delivery));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Small sleep to avoid busy-waiting
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn ack(&self, delivery_tag: u64) -> Result<(), SubscribeError> {
        let mut state = self.lock_state();
        let (envelope, _) = state
            .in_flight
            .remove(&delivery_tag)
            .ok_or(SubscribeError::UnknownDelivery(delivery_tag))?;
        state.record_ack(envelope.id);
        Ok(())
    }

    fn nack(
        &self,
        delivery_tag: u64,
        _reason: &str,
        requeue_after: Duration,
    ) -> Result<(), SubscribeError> {
        let mut state = self.lock_state();
        let (envelope, redelivered) = state
            .in_flight
            .remove(&delivery_tag)
            .ok_or(SubscribeError::UnknownDelivery(delivery_tag))?;
        state.redeliveries.push(Redelivery {
            visible_at: Instant::now() + requeue_after,
            envelope,
            redelivered: redelivered + 1,
        });
        Ok(())
    }
}
