//! Storage interface for the outbox and inbox tables.
//!
//! A [`Store`] hands out [`Transaction`]s (units of work) and offers the
//! single-row, compare-and-swap operations the dispatcher, consumer and
//! operator tooling need outside a unit of work. Any store with atomic
//! read-modify-write on a row can implement it; [`MemoryStore`] is the
//! reference implementation.

mod memory;

use std::time::SystemTime;

pub use memory::{MemoryStore, MemoryTransaction};

use crate::error::StoreError;
use crate::message::{
    InboxChange, InboxMessage, MessageId, MessageStatus, OutboxChange, OutboxMessage, StatusCounts,
};

/// Selects outbox rows a dispatcher may pick up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutboxFilter {
    /// Failed rows with this many retries are exhausted and left alone.
    pub max_retries: u32,
    /// Reference time for leases and delayed rows.
    pub now: SystemTime,
}

impl OutboxFilter {
    pub fn pending(max_retries: u32, now: SystemTime) -> Self {
        Self { max_retries, now }
    }

    pub fn matches(&self, message: &OutboxMessage) -> bool {
        message.is_dispatchable(self.max_retries, self.now)
    }
}

/// Listing query for operator tooling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub status: Option<MessageStatus>,
    /// Only rows with at least this many retries.
    pub min_retries: Option<u32>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Failed rows that used up `max_retries` attempts.
    pub fn exhausted(max_retries: u32) -> Self {
        Self {
            status: Some(MessageStatus::Failed),
            min_retries: Some(max_retries),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, status: MessageStatus, retries: u32) -> bool {
        self.status.map(|s| s == status).unwrap_or(true)
            && self.min_retries.map(|min| retries >= min).unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStatistics {
    pub outbox: StatusCounts,
    pub inbox: StatusCounts,
}

/// A unit of work.
///
/// Writes made through a transaction become visible together on `commit` or
/// not at all. Dropping a transaction without committing rolls it back.
pub trait Transaction: Send {
    /// Stage outbox rows for insertion at commit.
    fn insert_outbox(&mut self, rows: Vec<OutboxMessage>) -> Result<(), StoreError>;

    /// Read an inbox row. The version read is checked again at commit.
    fn find_inbox(&mut self, key: &str) -> Result<Option<InboxMessage>, StoreError>;

    /// Stage an inbox write. `row.version` must be the version read (0 for a
    /// new row); commit fails with `VersionConflict` if it moved.
    fn save_inbox(&mut self, row: InboxMessage) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>;

    fn rollback(self);
}

pub trait Store: Send + Sync {
    type Transaction: Transaction;

    fn begin(&self) -> Result<Self::Transaction, StoreError>;

    /// Dispatchable rows ordered by `created_at`, then id, at most `limit`.
    fn query_pending_outbox(
        &self,
        filter: &OutboxFilter,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Compare-and-swap a status transition. Returns the updated row.
    fn update_outbox(
        &self,
        id: MessageId,
        expected_version: u64,
        change: OutboxChange,
    ) -> Result<OutboxMessage, StoreError>;

    fn get_outbox(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError>;

    fn query_outbox(&self, query: &MessageQuery) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Delete Succeeded rows whose `expires_at` is at or before `now`.
    fn delete_expired_outbox(&self, now: SystemTime, limit: usize) -> Result<usize, StoreError>;

    fn get_inbox(&self, key: &str) -> Result<Option<InboxMessage>, StoreError>;

    fn query_inbox(&self, query: &MessageQuery) -> Result<Vec<InboxMessage>, StoreError>;

    fn update_inbox(
        &self,
        key: &str,
        expected_version: u64,
        change: InboxChange,
    ) -> Result<InboxMessage, StoreError>;

    /// Delete Succeeded rows whose `expires_at` is at or before `now`.
    fn delete_expired_inbox(&self, now: SystemTime, limit: usize) -> Result<usize, StoreError>;

    fn statistics(&self) -> Result<StoreStatistics, StoreError>;
}
