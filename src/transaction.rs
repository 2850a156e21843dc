//! Transaction coordinator: business writes and outbox rows in one commit.
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use sourced_outbox::{IntegrationEvent, MemoryStore, TransactionCoordinator};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderCreated { order_id: String }
//!
//! impl IntegrationEvent for OrderCreated {
//!     const NAME: &'static str = "OrderCreated";
//! }
//!
//! let store = Arc::new(MemoryStore::new());
//! let coordinator = TransactionCoordinator::new(store.clone());
//!
//! coordinator
//!     .execute(|tx, events| {
//!         tx.put("orders", "o-1", &42)?;
//!         events.publish(&OrderCreated { order_id: "o-1".into() });
//!         Ok::<_, sourced_outbox::StoreError>(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(store.outbox_len().unwrap(), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::CodecError;
use crate::error::TransactionError;
use crate::event::IntegrationEvent;
use crate::message::OutboxMessage;
use crate::store::{Store, Transaction};

/// Events buffered by a unit of work.
///
/// They are turned into outbox rows after the business work returns and
/// before the transaction commits.
#[derive(Debug, Default)]
pub struct PendingEvents {
    messages: Vec<OutboxMessage>,
    headers: BTreeMap<String, String>,
    error: Option<CodecError>,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a typed event, encoded with its codec.
    pub fn publish<E: IntegrationEvent>(&mut self, event: &E) {
        if let Some(message) = self.encode(event) {
            self.messages.push(message);
        }
    }

    /// Buffer a typed event that may not be published before `delay` elapsed.
    pub fn publish_delayed<E: IntegrationEvent>(&mut self, event: &E, delay: Duration) {
        if let Some(message) = self.encode(event) {
            self.messages.push(message.delayed(delay));
        }
    }

    /// Buffer an already serialized JSON payload.
    pub fn publish_raw(&mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.messages.push(OutboxMessage::new(name, content.into()));
    }

    /// Header stamped on every event of this unit of work (correlation id,
    /// causation id, tenant).
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn encode<E: IntegrationEvent>(&mut self, event: &E) -> Option<OutboxMessage> {
        let codec = E::codec();
        match codec.encode(event) {
            Ok(content) => {
                Some(OutboxMessage::new(E::NAME, content).with_content_type(codec.content_type()))
            }
            Err(err) => {
                // keep the first failure; the commit is refused either way
                self.error.get_or_insert(err);
                None
            }
        }
    }

    fn into_messages(self) -> Result<Vec<OutboxMessage>, CodecError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let headers = self.headers;
        Ok(self
            .messages
            .into_iter()
            .map(|mut message| {
                for (key, value) in &headers {
                    message
                        .headers
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                message
            })
            .collect())
    }
}

/// Runs business work and appends its events to the outbox atomically.
pub struct TransactionCoordinator<S> {
    store: Arc<S>,
}

impl<S> Clone for TransactionCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> TransactionCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `work` in a fresh unit of work.
    ///
    /// When `work` returns `Ok`, every event it buffered becomes an outbox row
    /// in the same commit. On any error nothing is written.
    pub fn execute<T, E, F>(&self, work: F) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(&mut S::Transaction, &mut PendingEvents) -> Result<T, E>,
    {
        self.execute_with(PendingEvents::new(), work)
    }

    /// Like [`execute`](Self::execute), starting from events known up front.
    pub fn execute_with<T, E, F>(
        &self,
        mut events: PendingEvents,
        work: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(&mut S::Transaction, &mut PendingEvents) -> Result<T, E>,
    {
        let mut tx = self
            .store
            .begin()
            .map_err(TransactionError::StorageCommitFailed)?;

        let value = match work(&mut tx, &mut events) {
            Ok(value) => value,
            Err(err) => {
                tx.rollback();
                debug!(discarded = events.len(), "business work failed, rolled back");
                return Err(TransactionError::Business(err));
            }
        };

        let messages = match events.into_messages() {
            Ok(messages) => messages,
            Err(err) => {
                tx.rollback();
                warn!(error = %err, "could not encode integration event, rolled back");
                return Err(TransactionError::Encode(err));
            }
        };

        let count = messages.len();
        if let Err(err) = tx.insert_outbox(messages) {
            tx.rollback();
            warn!(error = %err, "outbox insert failed, rolled back");
            return Err(TransactionError::StorageCommitFailed(err));
        }
        tx.commit().map_err(|err| {
            warn!(error = %err, events = count, "commit failed");
            TransactionError::StorageCommitFailed(err)
        })?;

        debug!(events = count, "transaction committed");
        Ok(value)
    }
}
