//! Operator view over the outbox and inbox tables.

use std::sync::Arc;

use tracing::info;

use crate::config::OutboxConfig;
use crate::error::StoreError;
use crate::message::{InboxChange, InboxMessage, MessageId, MessageStatus, OutboxChange, OutboxMessage};
use crate::store::{MessageQuery, Store, StoreStatistics};

/// Read-mostly access for dashboards and on-call tooling.
///
/// Besides listing rows it offers the two operator actions the engine never
/// takes on its own: putting an exhausted outbox row or inbox key back into
/// play.
pub struct Monitor<S> {
    store: Arc<S>,
    max_retries: u32,
}

impl<S: Store> Monitor<S> {
    /// `max_retries` must match the dispatcher and consumer configuration.
    pub fn new(store: Arc<S>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    pub fn from_config(store: Arc<S>, config: &OutboxConfig) -> Self {
        Self::new(store, config.retry.max_retries)
    }

    pub fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        self.store.statistics()
    }

    pub fn outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        self.store.get_outbox(id)
    }

    pub fn inbox_message(&self, key: &str) -> Result<Option<InboxMessage>, StoreError> {
        self.store.get_inbox(key)
    }

    pub fn outbox_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        self.store
            .query_outbox(&MessageQuery::status(status).with_limit(limit))
    }

    pub fn inbox_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        self.store
            .query_inbox(&MessageQuery::status(status).with_limit(limit))
    }

    /// Outbox rows that will not be published again without an operator.
    pub fn exhausted_outbox(&self) -> Result<Vec<OutboxMessage>, StoreError> {
        self.store
            .query_outbox(&MessageQuery::exhausted(self.max_retries))
    }

    /// Inbox keys whose handler gave up.
    pub fn exhausted_inbox(&self) -> Result<Vec<InboxMessage>, StoreError> {
        self.store
            .query_inbox(&MessageQuery::exhausted(self.max_retries))
    }

    /// Reset a failed outbox row to Scheduled with a fresh retry budget.
    pub fn requeue_outbox(&self, id: MessageId) -> Result<OutboxMessage, StoreError> {
        let row = self
            .store
            .get_outbox(id)?
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {}", id)))?;
        let requeued = self
            .store
            .update_outbox(id, row.status_version, OutboxChange::Requeue)?;
        info!(message_id = %id, name = %requeued.name, previous_retries = row.retries, "outbox message requeued");
        Ok(requeued)
    }

    /// Reset a failed inbox key so its next delivery, or a replay, runs the
    /// handler again.
    pub fn requeue_inbox(&self, key: &str) -> Result<InboxMessage, StoreError> {
        let row = self
            .store
            .get_inbox(key)?
            .ok_or_else(|| StoreError::NotFound(format!("inbox message {}", key)))?;
        let requeued = self
            .store
            .update_inbox(key, row.version, InboxChange::Requeue)?;
        info!(key = %key, name = %requeued.name, previous_retries = row.retries, "inbox message requeued");
        Ok(requeued)
    }
}
