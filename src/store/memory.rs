//! In-process store used by tests and dry runs.
//!
//! Models the parts of a pooled relational store the pipeline relies on:
//! per-connection foreign-key enforcement that survives in the pool, snapshot
//! transactions replayed on commit, non-transactional id sequences, aborted
//! transactions that only accept a rollback, and one-shot statement failures.
//! A session dropped with an open transaction is discarded, never pooled.
//!
//! Unique keys behave like a unique index under read committed: an insert of a
//! key another open transaction inserted waits for that transaction to end,
//! and keys committed by others after `begin` are visible to later statements.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::batch::Value;
use crate::error::{StoreError, StoreResult};
use crate::store::{ConflictPolicy, Session, Store, TableSpec, WriteCounts};

#[derive(Debug, Clone)]
struct MemRow {
    id: i64,
    values: Vec<Value>,
}

type Tables = HashMap<String, Vec<MemRow>>;

#[derive(Debug, Clone, Copy)]
struct Connection {
    id: u64,
    fk_enforced: bool,
}

#[derive(Debug)]
enum Write {
    Insert,
    Update(Vec<usize>),
}

#[derive(Debug)]
struct LogEntry {
    table: String,
    key_idx: Vec<usize>,
    row: MemRow,
    write: Write,
}

#[derive(Debug)]
struct Tx {
    snapshot: Tables,
    log: Vec<LogEntry>,
    aborted: bool,
    fk_at_begin: bool,
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connections_opened: u64,
    pub connections_discarded: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

/// A unique key inserted by a transaction that has not ended yet.
#[derive(Debug)]
struct Reservation {
    conn: u64,
    table: String,
    key: Vec<Value>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: Tables,
    sequences: HashMap<String, i64>,
    reserved: Vec<Reservation>,
    idle: Vec<Connection>,
    next_connection: u64,
    failures: HashMap<String, String>,
    begin_failure: Option<(u64, String)>,
    stats: MemoryStats,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    /// Make the next insert into `table` fail with `message`.
    pub fn fail_next_insert(&self, table: &str, message: &str) {
        self.lock()
            .failures
            .insert(table.to_string(), message.to_string());
    }

    /// Make the `nth` `begin` from now on, counted across all sessions, fail
    /// with `message`.
    pub fn fail_begin(&self, nth: u64, message: &str) {
        self.lock().begin_failure = Some((nth.max(1), message.to_string()));
    }

    /// Committed rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.lock()
            .committed
            .get(table)
            .map(|rows| rows.iter().map(|r| r.values.clone()).collect())
            .unwrap_or_default()
    }

    /// Committed rows of `table` with their surrogate ids.
    pub fn rows_with_ids(&self, table: &str) -> Vec<(i64, Vec<Value>)> {
        self.lock()
            .committed
            .get(table)
            .map(|rows| rows.iter().map(|r| (r.id, r.values.clone())).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().committed.get(table).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// True when every pooled connection enforces foreign keys.
    pub fn pool_enforces_referential_integrity(&self) -> bool {
        self.lock().idle.iter().all(|c| c.fk_enforced)
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // a panicking test thread must not poison the store for the rest of the run
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn release(&mut self, conn: u64) {
        self.reserved.retain(|r| r.conn != conn);
    }

    fn committed_row(&self, table: &str, key_idx: &[usize], key: &[Value]) -> Option<MemRow> {
        self.committed
            .get(table)?
            .iter()
            .find(|r| project(&r.values, key_idx) == key)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self) -> StoreResult<Box<dyn Session>> {
        let mut shared = self.lock();
        let conn = match shared.idle.pop() {
            Some(conn) => conn,
            None => {
                shared.next_connection += 1;
                shared.stats.connections_opened += 1;
                Connection {
                    id: shared.next_connection,
                    fk_enforced: true,
                }
            }
        };
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            conn,
            tx: None,
        }))
    }
}

pub struct MemorySession {
    shared: Arc<Mutex<Shared>>,
    conn: Connection,
    tx: Option<Tx>,
}

impl MemorySession {
    /// True while another open transaction holds one of the keys of `rows`.
    fn blocked(&self, table: &TableSpec, rows: &[Vec<Value>]) -> bool {
        let key_idx = table.key_indices();
        if key_idx.is_empty() {
            return false;
        }
        let shared = lock(&self.shared);
        shared
            .reserved
            .iter()
            .filter(|r| r.conn != self.conn.id && r.table == table.name)
            .any(|r| rows.iter().any(|row| project(row, &key_idx) == r.key))
    }

    fn open_tx(&mut self) {
        let snapshot = lock(&self.shared).committed.clone();
        self.tx = Some(Tx {
            snapshot,
            log: Vec::new(),
            aborted: false,
            fk_at_begin: self.conn.fk_enforced,
        });
    }

    fn ensure_usable(&self) -> StoreResult<()> {
        match &self.tx {
            Some(tx) if tx.aborted => Err(StoreError::TransactionAborted),
            _ => Ok(()),
        }
    }

    fn abort(&mut self, err: StoreError) -> StoreError {
        if let Some(tx) = self.tx.as_mut() {
            tx.aborted = true;
        }
        err
    }

    fn commit_tx(&mut self) -> StoreResult<()> {
        let Some(tx) = self.tx.take() else {
            return Err(StoreError::NoTransaction);
        };
        let mut shared = lock(&self.shared);
        shared.release(self.conn.id);
        if tx.aborted {
            // a commit of a failed transaction rolls it back
            self.conn.fk_enforced = tx.fk_at_begin;
            shared.stats.rollbacks += 1;
            return Err(StoreError::TransactionAborted);
        }
        let duplicate = tx.log.iter().find(|entry| {
            matches!(entry.write, Write::Insert)
                && !entry.key_idx.is_empty()
                && shared
                    .committed_row(
                        &entry.table,
                        &entry.key_idx,
                        &project(&entry.row.values, &entry.key_idx),
                    )
                    .is_some()
        });
        if let Some(entry) = duplicate {
            let table = entry.table.clone();
            self.conn.fk_enforced = tx.fk_at_begin;
            shared.stats.rollbacks += 1;
            return Err(StoreError::Constraint {
                table,
                message: "duplicate key value violates unique constraint".into(),
            });
        }
        for entry in tx.log {
            let rows = shared.committed.entry(entry.table).or_default();
            let key = project(&entry.row.values, &entry.key_idx);
            let existing = rows.iter().position(|r| {
                !entry.key_idx.is_empty() && project(&r.values, &entry.key_idx) == key
            });
            match (existing, entry.write) {
                (Some(pos), Write::Update(cols)) => {
                    for c in cols {
                        rows[pos].values[c] = entry.row.values[c].clone();
                    }
                }
                _ => rows.push(entry.row),
            }
        }
        shared.stats.commits += 1;
        Ok(())
    }

    fn check_foreign_keys(
        shared: &Mutex<Shared>,
        snapshot: &Tables,
        table: &TableSpec,
        row: &[Value],
    ) -> StoreResult<()> {
        for fk in &table.foreign_keys {
            let Some(idx) = table.column_index(&fk.column) else {
                continue;
            };
            let Some(value) = row.get(idx).and_then(Value::as_i64) else {
                continue;
            };
            let has_id = |tables: &Tables| {
                tables
                    .get(&fk.references)
                    .is_some_and(|rows| rows.iter().any(|r| r.id == value))
            };
            let exists = has_id(snapshot) || has_id(&lock(shared).committed);
            if !exists {
                return Err(StoreError::Constraint {
                    table: table.name.clone(),
                    message: format!(
                        "{}={} is not present in table {}",
                        fk.column, value, fk.references
                    ),
                });
            }
        }
        Ok(())
    }

    fn insert_in_tx(
        &mut self,
        table: &TableSpec,
        rows: &[Vec<Value>],
        policy: &ConflictPolicy,
    ) -> StoreResult<WriteCounts> {
        let injected = lock(&self.shared).failures.remove(&table.name);
        if let Some(message) = injected {
            return Err(self.abort(StoreError::Injected {
                table: table.name.clone(),
                message,
            }));
        }

        let fk_enforced = self.conn.fk_enforced;
        let conn = self.conn.id;
        let key_idx = table.key_indices();
        let update_idx: Vec<usize> = match policy {
            ConflictPolicy::Ignore => Vec::new(),
            ConflictPolicy::Merge { update } => {
                update.iter().filter_map(|c| table.column_index(c)).collect()
            }
        };
        let shared = Arc::clone(&self.shared);
        let Some(tx) = self.tx.as_mut() else {
            return Err(StoreError::NoTransaction);
        };

        let mut counts = WriteCounts::default();
        let mut touched: Vec<Vec<Value>> = Vec::new();
        let mut failure = None;
        for row in rows {
            if row.len() != table.columns.len() {
                failure = Some(StoreError::Arity {
                    table: table.name.clone(),
                    expected: table.columns.len(),
                    actual: row.len(),
                });
                break;
            }
            if fk_enforced {
                if let Err(err) = Self::check_foreign_keys(&shared, &tx.snapshot, table, row) {
                    failure = Some(err);
                    break;
                }
            }
            let key = project(row, &key_idx);
            if matches!(policy, ConflictPolicy::Merge { .. }) && !key_idx.is_empty() {
                if touched.contains(&key) {
                    failure = Some(StoreError::Constraint {
                        table: table.name.clone(),
                        message: "ON CONFLICT DO UPDATE command cannot affect row a second time"
                            .into(),
                    });
                    break;
                }
                touched.push(key.clone());
            }

            let rows_in_table = tx.snapshot.entry(table.name.clone()).or_default();
            let mut existing = rows_in_table
                .iter()
                .position(|r| !key_idx.is_empty() && project(&r.values, &key_idx) == key);
            if existing.is_none() && !key_idx.is_empty() {
                // committed by another session after this transaction began
                let committed = lock(&shared).committed_row(&table.name, &key_idx, &key);
                if let Some(row) = committed {
                    rows_in_table.push(row);
                    existing = Some(rows_in_table.len() - 1);
                }
            }
            match (existing, policy) {
                (Some(_), ConflictPolicy::Ignore) => counts.skipped += 1,
                (Some(pos), ConflictPolicy::Merge { .. }) => {
                    let current = &mut rows_in_table[pos];
                    for &c in &update_idx {
                        current.values[c] = row[c].clone();
                    }
                    tx.log.push(LogEntry {
                        table: table.name.clone(),
                        key_idx: key_idx.clone(),
                        row: current.clone(),
                        write: Write::Update(update_idx.clone()),
                    });
                    counts.updated += 1;
                }
                (None, _) => {
                    let id = {
                        let mut shared = lock(&shared);
                        if !key_idx.is_empty() {
                            shared.reserved.push(Reservation {
                                conn,
                                table: table.name.clone(),
                                key: key.clone(),
                            });
                        }
                        let seq = shared.sequences.entry(table.name.clone()).or_insert(0);
                        *seq += 1;
                        *seq
                    };
                    let new_row = MemRow {
                        id,
                        values: row.clone(),
                    };
                    rows_in_table.push(new_row.clone());
                    tx.log.push(LogEntry {
                        table: table.name.clone(),
                        key_idx: key_idx.clone(),
                        row: new_row,
                        write: Write::Insert,
                    });
                    counts.inserted += 1;
                }
            }
        }

        match failure {
            Some(err) => Err(self.abort(err)),
            None => Ok(counts),
        }
    }
}

fn project(values: &[Value], idx: &[usize]) -> Vec<Value> {
    idx.iter()
        .map(|&i| values.get(i).cloned().unwrap_or_default())
        .collect()
}

#[async_trait]
impl Session for MemorySession {
    async fn begin(&mut self) -> StoreResult<()> {
        if self.tx.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        let injected = {
            let mut shared = lock(&self.shared);
            let fire = match shared.begin_failure.as_mut() {
                Some((remaining, _)) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                None => false,
            };
            if fire {
                shared.begin_failure.take().map(|(_, message)| message)
            } else {
                None
            }
        };
        if let Some(message) = injected {
            return Err(StoreError::Injected {
                table: "begin".into(),
                message,
            });
        }
        self.open_tx();
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.commit_tx()
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let Some(tx) = self.tx.take() else {
            return Err(StoreError::NoTransaction);
        };
        self.conn.fk_enforced = tx.fk_at_begin;
        let mut shared = lock(&self.shared);
        shared.release(self.conn.id);
        shared.stats.rollbacks += 1;
        Ok(())
    }

    async fn flush(&mut self) -> StoreResult<()> {
        self.ensure_usable()
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn is_aborted(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.aborted)
    }

    async fn referential_integrity(&mut self) -> StoreResult<bool> {
        self.ensure_usable()?;
        Ok(self.conn.fk_enforced)
    }

    async fn set_referential_integrity(&mut self, enforced: bool) -> StoreResult<()> {
        self.ensure_usable()?;
        self.conn.fk_enforced = enforced;
        Ok(())
    }

    async fn select_ids(
        &mut self,
        table: &TableSpec,
        keys: &[Vec<Value>],
    ) -> StoreResult<Vec<(Vec<Value>, i64)>> {
        self.ensure_usable()?;
        let key_idx = table.key_indices();
        let types = table.key_types();
        let own = self
            .tx
            .as_ref()
            .and_then(|tx| tx.snapshot.get(&table.name).cloned())
            .unwrap_or_default();
        let committed = lock(&self.shared)
            .committed
            .get(&table.name)
            .cloned()
            .unwrap_or_default();

        let mut found = Vec::new();
        for key in keys {
            let coerced: Vec<Value> = key
                .iter()
                .zip(&types)
                .map(|(v, ty)| ty.coerce(v).unwrap_or_default())
                .collect();
            // own writes first, then rows other sessions have committed
            if let Some(row) = own
                .iter()
                .chain(committed.iter())
                .find(|r| project(&r.values, &key_idx) == coerced)
            {
                found.push((coerced, row.id));
            }
        }
        Ok(found)
    }

    async fn insert(
        &mut self,
        table: &TableSpec,
        rows: &[Vec<Value>],
        policy: &ConflictPolicy,
    ) -> StoreResult<WriteCounts> {
        self.ensure_usable()?;
        if rows.is_empty() {
            return Ok(WriteCounts::default());
        }
        while self.blocked(table, rows) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let implicit = self.tx.is_none();
        if implicit {
            self.open_tx();
        }
        let result = self.insert_in_tx(table, rows, policy);
        if implicit {
            match &result {
                Ok(_) => self.commit_tx()?,
                Err(_) => {
                    self.tx = None;
                    let mut shared = lock(&self.shared);
                    shared.release(self.conn.id);
                    shared.stats.rollbacks += 1;
                }
            }
        }
        debug!(table = %table.name, rows = rows.len(), ok = result.is_ok(), "memory insert");
        result
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.release(self.conn.id);
        if self.tx.is_some() {
            shared.stats.connections_discarded += 1;
            debug!(connection = self.conn.id, "discarding connection with open transaction");
        } else {
            shared.idle.push(self.conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ColumnType;

    fn facilities() -> TableSpec {
        TableSpec::new("facilities")
            .id("id")
            .column("name_key", ColumnType::Text)
            .column("name", ColumnType::Text)
            .conflict_key(&["name_key"])
    }

    fn visits() -> TableSpec {
        TableSpec::new("visits")
            .id("id")
            .column("facility_id", ColumnType::BigInt)
            .column("note", ColumnType::Text)
            .conflict_key(&["facility_id"])
            .references("facility_id", "facilities")
    }

    fn row(key: &str, name: &str) -> Vec<Value> {
        vec![Value::from(key), Value::from(name)]
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut a = store.connect().await.unwrap();
        a.begin().await.unwrap();
        a.insert(&facilities(), &[row("el_pino", "El Pino")], &ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert_eq!(store.row_count("facilities"), 0);
        let ids = a
            .select_ids(&facilities(), &[vec![Value::from("el_pino")]])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        a.commit().await.unwrap();
        assert_eq!(store.row_count("facilities"), 1);
    }

    #[tokio::test]
    async fn key_committed_by_another_session_is_skipped_and_visible() {
        let store = MemoryStore::new();
        let mut a = store.connect().await.unwrap();
        let mut b = store.connect().await.unwrap();
        b.begin().await.unwrap();
        a.insert(&facilities(), &[row("el_pino", "El Pino")], &ConflictPolicy::Ignore)
            .await
            .unwrap();

        let counts = b
            .insert(&facilities(), &[row("el_pino", "El Pino")], &ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert_eq!((counts.inserted, counts.skipped), (0, 1));
        let ids = b
            .select_ids(&facilities(), &[vec![Value::from("el_pino")]])
            .await
            .unwrap();
        b.commit().await.unwrap();
        assert_eq!(store.rows_with_ids("facilities")[0].0, ids[0].1);
        assert_eq!(store.row_count("facilities"), 1);
    }

    #[tokio::test]
    async fn insert_waits_for_the_transaction_holding_its_key() {
        let store = MemoryStore::new();
        let mut a = store.connect().await.unwrap();
        let mut b = store.connect().await.unwrap();
        a.begin().await.unwrap();
        b.begin().await.unwrap();
        a.insert(&facilities(), &[row("el_pino", "El Pino")], &ConflictPolicy::Ignore)
            .await
            .unwrap();

        let (counts, ()) = tokio::join!(
            async {
                b.insert(&facilities(), &[row("el_pino", "El Pino")], &ConflictPolicy::Ignore)
                    .await
                    .unwrap()
            },
            async {
                tokio::task::yield_now().await;
                a.rollback().await.unwrap();
            }
        );
        assert_eq!(counts.inserted, 1);
        b.commit().await.unwrap();
        assert_eq!(store.row_count("facilities"), 1);
    }

    #[tokio::test]
    async fn ignore_and_merge_report_counts() {
        let store = MemoryStore::new();
        let mut s = store.connect().await.unwrap();
        let spec = facilities();
        let first = s
            .insert(&spec, &[row("a", "A"), row("b", "B")], &ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);
        let again = s
            .insert(&spec, &[row("a", "A2"), row("c", "C")], &ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert_eq!((again.inserted, again.skipped), (1, 1));
        let merged = s
            .insert(&spec, &[row("a", "A3")], &ConflictPolicy::merge(&["name"]))
            .await
            .unwrap();
        assert_eq!(merged.updated, 1);
        assert_eq!(store.rows("facilities")[0], row("a", "A3"));
    }

    #[tokio::test]
    async fn merge_rejects_duplicate_keys_in_one_statement() {
        let store = MemoryStore::new();
        let mut s = store.connect().await.unwrap();
        s.begin().await.unwrap();
        let err = s
            .insert(
                &facilities(),
                &[row("a", "A"), row("a", "A again")],
                &ConflictPolicy::merge(&["name"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
        assert!(s.is_aborted());
    }

    #[tokio::test]
    async fn foreign_keys_enforced_unless_suspended() {
        let store = MemoryStore::new();
        let mut s = store.connect().await.unwrap();
        let orphan = vec![Value::Int(99), Value::from("orphan")];
        let err = s
            .insert(&visits(), &[orphan.clone()], &ConflictPolicy::Ignore)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));

        s.set_referential_integrity(false).await.unwrap();
        s.insert(&visits(), &[orphan], &ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert_eq!(store.row_count("visits"), 1);
    }

    #[tokio::test]
    async fn aborted_transaction_only_accepts_rollback() {
        let store = MemoryStore::new();
        store.fail_next_insert("facilities", "connection reset");
        let mut s = store.connect().await.unwrap();
        s.set_referential_integrity(false).await.unwrap();
        s.begin().await.unwrap();
        assert!(s
            .insert(&facilities(), &[row("a", "A")], &ConflictPolicy::Ignore)
            .await
            .is_err());
        assert!(matches!(
            s.set_referential_integrity(true).await,
            Err(StoreError::TransactionAborted)
        ));
        s.rollback().await.unwrap();
        s.set_referential_integrity(true).await.unwrap();
        assert!(s.referential_integrity().await.unwrap());
    }

    #[tokio::test]
    async fn connection_settings_survive_in_the_pool() {
        let store = MemoryStore::new();
        {
            let mut s = store.connect().await.unwrap();
            s.set_referential_integrity(false).await.unwrap();
        }
        assert!(!store.pool_enforces_referential_integrity());
        let mut again = store.connect().await.unwrap();
        assert!(!again.referential_integrity().await.unwrap());
        assert_eq!(store.stats().connections_opened, 1);
    }

    #[tokio::test]
    async fn dropping_open_transaction_discards_connection() {
        let store = MemoryStore::new();
        {
            let mut s = store.connect().await.unwrap();
            s.set_referential_integrity(false).await.unwrap();
            s.begin().await.unwrap();
        }
        assert_eq!(store.stats().connections_discarded, 1);
        assert!(store.pool_enforces_referential_integrity());
    }
}
