use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{MessageQuery, OutboxFilter, Store, StoreStatistics, Transaction};
use crate::error::StoreError;
use crate::message::{
    InboxChange, InboxMessage, MessageId, OutboxChange, OutboxMessage, StatusCounts,
};

type RowKey = (String, String);

#[derive(Clone, Debug)]
struct VersionedRow {
    value: Value,
    version: u64,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<RowKey, VersionedRow>,
    outbox: BTreeMap<MessageId, OutboxMessage>,
    inbox: HashMap<String, InboxMessage>,
}

impl Tables {
    fn row_version(&self, key: &RowKey) -> u64 {
        self.rows.get(key).map(|row| row.version).unwrap_or(0)
    }

    fn inbox_version(&self, key: &str) -> u64 {
        self.inbox.get(key).map(|row| row.version).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_commits: usize,
    fail_status_updates: usize,
}

/// In-memory store of record.
///
/// Holds business rows (JSON values addressed by table and key) next to the
/// outbox and inbox tables, so a [`MemoryTransaction`] can commit all three
/// atomically. Concurrency control is optimistic: every row carries a
/// version, reads inside a transaction are re-validated at commit, and a
/// moved version fails the commit with [`StoreError::VersionConflict`].
///
/// Cloning creates another handle to the same storage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails with `Unavailable` until restored.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    /// Fail the next `count` commits with `Unavailable`.
    pub fn fail_next_commits(&self, count: usize) {
        self.faults().fail_commits = count;
    }

    /// Fail the next `count` outbox `Succeed`/`Fail` updates with
    /// `Unavailable`. Claims go through.
    pub fn fail_next_status_updates(&self, count: usize) {
        self.faults().fail_status_updates = count;
    }

    /// Committed business row.
    pub fn row<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>, StoreError> {
        let tables = self.read()?;
        tables
            .rows
            .get(&(table.to_string(), key.to_string()))
            .map(|row| from_value(row.value.clone()))
            .transpose()
    }

    /// Number of committed rows in a business table.
    pub fn table_len(&self, table: &str) -> Result<usize, StoreError> {
        Ok(self.read()?.rows.keys().filter(|(t, _)| t == table).count())
    }

    pub fn outbox_len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.outbox.len())
    }

    pub fn inbox_len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.inbox.len())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults().unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.check_available()?;
        self.tables
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.check_available()?;
        self.tables
            .write()
            .map_err(|_| StoreError::LockPoisoned("write"))
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn limited<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

impl Store for MemoryStore {
    type Transaction = MemoryTransaction;

    fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        self.check_available()?;
        Ok(MemoryTransaction::new(self.clone()))
    }

    fn query_pending_outbox(
        &self,
        filter: &OutboxFilter,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let tables = self.read()?;
        let mut pending: Vec<OutboxMessage> = tables
            .outbox
            .values()
            .filter(|message| filter.matches(message))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    fn update_outbox(
        &self,
        id: MessageId,
        expected_version: u64,
        change: OutboxChange,
    ) -> Result<OutboxMessage, StoreError> {
        if matches!(change, OutboxChange::Succeed { .. } | OutboxChange::Fail { .. }) {
            let mut faults = self.faults();
            if faults.fail_status_updates > 0 {
                faults.fail_status_updates -= 1;
                return Err(StoreError::Unavailable("injected update failure".into()));
            }
        }

        let mut tables = self.write()?;
        let message = tables
            .outbox
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {}", id)))?;

        if message.status_version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: message.status_version,
            });
        }
        if !message.apply(&change) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                status: message.status.to_string(),
                change: change.name(),
            });
        }
        Ok(message.clone())
    }

    fn get_outbox(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        Ok(self.read()?.outbox.get(&id).cloned())
    }

    fn query_outbox(&self, query: &MessageQuery) -> Result<Vec<OutboxMessage>, StoreError> {
        let tables = self.read()?;
        let rows = tables
            .outbox
            .values()
            .filter(|m| query.matches(m.status, m.retries))
            .cloned()
            .collect();
        Ok(limited(rows, query.limit))
    }

    fn delete_expired_outbox(&self, now: SystemTime, limit: usize) -> Result<usize, StoreError> {
        let mut tables = self.write()?;
        let expired: Vec<MessageId> = tables
            .outbox
            .values()
            .filter(|m| m.is_succeeded() && m.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|m| m.id)
            .take(limit)
            .collect();
        for id in &expired {
            tables.outbox.remove(id);
        }
        Ok(expired.len())
    }

    fn get_inbox(&self, key: &str) -> Result<Option<InboxMessage>, StoreError> {
        Ok(self.read()?.inbox.get(key).cloned())
    }

    fn query_inbox(&self, query: &MessageQuery) -> Result<Vec<InboxMessage>, StoreError> {
        let tables = self.read()?;
        let mut rows: Vec<InboxMessage> = tables
            .inbox
            .values()
            .filter(|m| query.matches(m.status, m.retries))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)));
        Ok(limited(rows, query.limit))
    }

    fn update_inbox(
        &self,
        key: &str,
        expected_version: u64,
        change: InboxChange,
    ) -> Result<InboxMessage, StoreError> {
        let mut tables = self.write()?;
        let row = tables
            .inbox
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("inbox message {}", key)))?;

        if row.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: key.to_string(),
                expected: expected_version,
                actual: row.version,
            });
        }
        if !row.apply(&change) {
            return Err(StoreError::InvalidTransition {
                id: key.to_string(),
                status: row.status.to_string(),
                change: "Requeue",
            });
        }
        row.version += 1;
        Ok(row.clone())
    }

    fn delete_expired_inbox(&self, now: SystemTime, limit: usize) -> Result<usize, StoreError> {
        let mut tables = self.write()?;
        let expired: Vec<String> = tables
            .inbox
            .values()
            .filter(|m| m.is_succeeded() && m.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|m| m.id.clone())
            .take(limit)
            .collect();
        for key in &expired {
            tables.inbox.remove(key);
        }
        Ok(expired.len())
    }

    fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let tables = self.read()?;
        let mut outbox = StatusCounts::default();
        for message in tables.outbox.values() {
            outbox.add(message.status);
        }
        let mut inbox = StatusCounts::default();
        for row in tables.inbox.values() {
            inbox.add(row.status);
        }
        Ok(StoreStatistics { outbox, inbox })
    }
}

/// Unit of work on a [`MemoryStore`].
///
/// Buffers writes and remembers the version of everything it read; `commit`
/// validates those versions and applies all writes under one write lock.
pub struct MemoryTransaction {
    store: MemoryStore,
    row_reads: HashMap<RowKey, u64>,
    row_writes: BTreeMap<RowKey, Option<Value>>,
    inbox_reads: HashMap<String, u64>,
    inbox_writes: BTreeMap<String, InboxMessage>,
    outbox_inserts: Vec<OutboxMessage>,
}

impl MemoryTransaction {
    fn new(store: MemoryStore) -> Self {
        Self {
            store,
            row_reads: HashMap::new(),
            row_writes: BTreeMap::new(),
            inbox_reads: HashMap::new(),
            inbox_writes: BTreeMap::new(),
            outbox_inserts: Vec::new(),
        }
    }

    /// Read a business row, seeing this transaction's own writes.
    pub fn get<T: DeserializeOwned>(&mut self, table: &str, key: &str) -> Result<Option<T>, StoreError> {
        let row_key = (table.to_string(), key.to_string());
        if let Some(staged) = self.row_writes.get(&row_key) {
            return staged.clone().map(from_value).transpose();
        }

        let tables = self.store.read()?;
        let current = tables.rows.get(&row_key).cloned();
        drop(tables);

        self.row_reads
            .entry(row_key)
            .or_insert_with(|| current.as_ref().map(|row| row.version).unwrap_or(0));
        current.map(|row| from_value(row.value)).transpose()
    }

    /// Stage a business row write.
    pub fn put<T: Serialize>(&mut self, table: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(value).map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.row_writes
            .insert((table.to_string(), key.to_string()), Some(value));
        Ok(())
    }

    /// Stage a business row delete.
    pub fn delete(&mut self, table: &str, key: &str) {
        self.row_writes
            .insert((table.to_string(), key.to_string()), None);
    }

    /// Outbox rows staged so far.
    pub fn staged_outbox(&self) -> &[OutboxMessage] {
        &self.outbox_inserts
    }

    fn validate(&self, tables: &Tables) -> Result<(), StoreError> {
        for (key, expected) in &self.row_reads {
            let actual = tables.row_version(key);
            if actual != *expected {
                return Err(StoreError::VersionConflict {
                    id: format!("{}/{}", key.0, key.1),
                    expected: *expected,
                    actual,
                });
            }
        }
        for (key, expected) in &self.inbox_reads {
            let actual = tables.inbox_version(key);
            if actual != *expected {
                return Err(StoreError::VersionConflict {
                    id: format!("inbox/{}", key),
                    expected: *expected,
                    actual,
                });
            }
        }
        for (key, row) in &self.inbox_writes {
            let actual = tables.inbox_version(key);
            if actual != row.version {
                return Err(StoreError::VersionConflict {
                    id: format!("inbox/{}", key),
                    expected: row.version,
                    actual,
                });
            }
        }
        for message in &self.outbox_inserts {
            if let Some(existing) = tables.outbox.get(&message.id) {
                return Err(StoreError::VersionConflict {
                    id: format!("outbox/{}", message.id),
                    expected: 0,
                    actual: existing.status_version,
                });
            }
        }
        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    fn insert_outbox(&mut self, rows: Vec<OutboxMessage>) -> Result<(), StoreError> {
        self.outbox_inserts.extend(rows);
        Ok(())
    }

    fn find_inbox(&mut self, key: &str) -> Result<Option<InboxMessage>, StoreError> {
        if let Some(staged) = self.inbox_writes.get(key) {
            return Ok(Some(staged.clone()));
        }

        let current = self.store.read()?.inbox.get(key).cloned();
        self.inbox_reads
            .entry(key.to_string())
            .or_insert_with(|| current.as_ref().map(|row| row.version).unwrap_or(0));
        Ok(current)
    }

    fn save_inbox(&mut self, row: InboxMessage) -> Result<(), StoreError> {
        self.inbox_writes.insert(row.id.clone(), row);
        Ok(())
    }

    fn commit(self) -> Result<(), StoreError> {
        {
            let mut faults = self.store.faults();
            if faults.fail_commits > 0 {
                faults.fail_commits -= 1;
                return Err(StoreError::Unavailable("injected commit failure".into()));
            }
        }

        let store = self.store.clone();
        let mut tables = store.write()?;
        self.validate(&tables)?;

        for (key, value) in self.row_writes {
            match value {
                Some(value) => {
                    let version = tables.row_version(&key) + 1;
                    tables.rows.insert(key, VersionedRow { value, version });
                }
                None => {
                    tables.rows.remove(&key);
                }
            }
        }
        for (key, mut row) in self.inbox_writes {
            row.version += 1;
            tables.inbox.insert(key, row);
        }
        for message in self.outbox_inserts {
            tables.outbox.insert(message.id, message);
        }
        Ok(())
    }

    fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Envelope;
    use std::time::Duration;

    #[test]
    fn commit_applies_rows_and_outbox_together() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.put("orders", "o-1", &serde_json::json!({"total": 10})).unwrap();
        tx.insert_outbox(vec![OutboxMessage::new("OrderCreated", b"{}".to_vec())])
            .unwrap();

        // nothing visible before commit
        assert_eq!(store.outbox_len().unwrap(), 0);
        assert_eq!(store.table_len("orders").unwrap(), 0);

        tx.commit().unwrap();
        assert_eq!(store.outbox_len().unwrap(), 1);
        let order: serde_json::Value = store.row("orders", "o-1").unwrap().unwrap();
        assert_eq!(order["total"], 10);
    }

    #[test]
    fn rollback_discards_everything() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.put("orders", "o-1", &1).unwrap();
        tx.insert_outbox(vec![OutboxMessage::new("OrderCreated", b"{}".to_vec())])
            .unwrap();
        tx.rollback();

        assert_eq!(store.outbox_len().unwrap(), 0);
        assert_eq!(store.table_len("orders").unwrap(), 0);
    }

    #[test]
    fn stale_read_fails_commit() {
        let store = MemoryStore::new();
        let mut seed = store.begin().unwrap();
        seed.put("stock", "sku-1", &5).unwrap();
        seed.commit().unwrap();

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        let a: i64 = first.get("stock", "sku-1").unwrap().unwrap();
        let b: i64 = second.get("stock", "sku-1").unwrap().unwrap();
        first.put("stock", "sku-1", &(a - 1)).unwrap();
        second.put("stock", "sku-1", &(b - 1)).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.row::<i64>("stock", "sku-1").unwrap(), Some(4));
    }

    #[test]
    fn concurrent_inbox_inserts_conflict() {
        let store = MemoryStore::new();
        let envelope = Envelope::with_string_payload("msg-1", "OrderCreated", "{}");

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        assert!(first.find_inbox("msg-1").unwrap().is_none());
        assert!(second.find_inbox("msg-1").unwrap().is_none());
        first.save_inbox(InboxMessage::received("msg-1", &envelope)).unwrap();
        second.save_inbox(InboxMessage::received("msg-1", &envelope)).unwrap();

        first.commit().unwrap();
        assert!(second.commit().unwrap_err().is_conflict());
        assert_eq!(store.get_inbox("msg-1").unwrap().unwrap().version, 1);
    }

    #[test]
    fn update_outbox_is_compare_and_swap() {
        let store = MemoryStore::new();
        let message = OutboxMessage::new("Event", b"{}".to_vec());
        let id = message.id;
        let mut tx = store.begin().unwrap();
        tx.insert_outbox(vec![message]).unwrap();
        tx.commit().unwrap();

        let now = SystemTime::now();
        let claim = OutboxChange::Claim {
            worker_id: "w1".into(),
            now,
            until: now + Duration::from_secs(60),
        };
        let claimed = store.update_outbox(id, 0, claim.clone()).unwrap();
        assert_eq!(claimed.status_version, 1);

        let err = store.update_outbox(id, 0, claim).unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                id: id.to_string(),
                expected: 0,
                actual: 1
            }
        );

        let err = store.update_outbox(id, 1, OutboxChange::Requeue).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { change: "Requeue", .. }));
    }

    #[test]
    fn pending_query_orders_by_creation_and_skips_leased() {
        let store = MemoryStore::new();
        let base = SystemTime::now();
        let mut rows = Vec::new();
        for (i, name) in ["Third", "First", "Second"].iter().enumerate() {
            let mut message = OutboxMessage::new(*name, b"{}".to_vec());
            message.created_at = base
                + match i {
                    0 => Duration::from_millis(30),
                    1 => Duration::from_millis(10),
                    _ => Duration::from_millis(20),
                };
            rows.push(message);
        }
        let mut tx = store.begin().unwrap();
        tx.insert_outbox(rows).unwrap();
        tx.commit().unwrap();

        let now = base + Duration::from_secs(1);
        let pending = store
            .query_pending_outbox(&OutboxFilter::pending(3, now), 10)
            .unwrap();
        let names: Vec<_> = pending.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["First", "Second", "Third"]);

        let first = &pending[0];
        store
            .update_outbox(
                first.id,
                first.status_version,
                OutboxChange::Claim {
                    worker_id: "w1".into(),
                    now,
                    until: now + Duration::from_secs(60),
                },
            )
            .unwrap();
        let pending = store
            .query_pending_outbox(&OutboxFilter::pending(3, now), 1)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "Second");
    }

    #[test]
    fn expired_delete_only_touches_succeeded() {
        let store = MemoryStore::new();
        let done = OutboxMessage::new("Done", b"{}".to_vec());
        let failed = OutboxMessage::new("Failed", b"{}".to_vec());
        let (done_id, failed_id) = (done.id, failed.id);
        let mut tx = store.begin().unwrap();
        tx.insert_outbox(vec![done, failed]).unwrap();
        tx.commit().unwrap();

        let now = SystemTime::now();
        store
            .update_outbox(done_id, 0, OutboxChange::Succeed { expires_at: now })
            .unwrap();
        store
            .update_outbox(failed_id, 0, OutboxChange::Fail { error: "x".into() })
            .unwrap();

        let deleted = store
            .delete_expired_outbox(now + Duration::from_secs(1), 100)
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_outbox(done_id).unwrap().is_none());
        assert!(store.get_outbox(failed_id).unwrap().is_some());
    }

    #[test]
    fn injected_faults() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let tx = store.begin().unwrap();
        assert!(matches!(tx.commit(), Err(StoreError::Unavailable(_))));
        store.begin().unwrap().commit().unwrap();

        store.set_unavailable(true);
        assert!(matches!(store.begin(), Err(StoreError::Unavailable(_))));
        assert!(store.statistics().is_err());
        store.set_unavailable(false);
        assert_eq!(store.statistics().unwrap(), StoreStatistics::default());
    }
}
