// Copyright 2024-2025 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The ordered, transactional key-value store underlying the filesystem.
//!
//! An [`Environment`] owns a set of named tables and a lock manager.
//! Environments are shared process-wide: opening the same path twice yields
//! handles onto the same tables. Transactions take table-granularity
//! shared/exclusive locks held until commit or abort (strict two-phase
//! locking); a cycle in the wait-for graph aborts the requesting
//! transaction with [`KvError::Deadlock`], which the trail runner above
//! this layer catches and retries.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Error from the key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    /// The transaction was chosen as the deadlock victim and must be
    /// retried from scratch.
    #[error("deadlock detected, transaction aborted")]
    Deadlock,
    #[error("key not found")]
    NotFound,
    /// The environment observed an unrecoverable condition. Sticky: every
    /// subsequent operation fails the same way until recovery is requested.
    #[error("key-value environment panic: {0}")]
    Panic(String),
    #[error("key-value store error: {0}")]
    Fatal(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Physical organization of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Ordered unique-key table.
    Btree,
    /// Ordered table allowing multiple values per key, kept in insertion
    /// order.
    DupBtree,
    /// Record-numbered table; records are appended and addressed by a
    /// 1-based record number.
    Recno,
}

#[derive(Debug)]
enum TableRows {
    Btree(BTreeMap<Vec<u8>, Vec<u8>>),
    Dup(BTreeMap<Vec<u8>, Vec<Vec<u8>>>),
    Recno(Vec<Vec<u8>>),
}

impl TableRows {
    fn new(kind: TableKind) -> Self {
        match kind {
            TableKind::Btree => Self::Btree(BTreeMap::new()),
            TableKind::DupBtree => Self::Dup(BTreeMap::new()),
            TableKind::Recno => Self::Recno(Vec::new()),
        }
    }
}

#[derive(Debug)]
struct TableInner {
    id: usize,
    name: String,
    kind: TableKind,
    rows: Mutex<TableRows>,
}

/// Handle onto one named table of an environment.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> TableKind {
        self.inner.kind
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default, Debug)]
struct LockState {
    /// table id -> (transaction -> granted mode)
    holders: HashMap<usize, HashMap<u64, LockMode>>,
    /// transaction -> the (table, mode) it is blocked on
    waits: HashMap<u64, (usize, LockMode)>,
}

impl LockState {
    fn grantable(&self, table: usize, txn: u64, mode: LockMode) -> bool {
        let Some(holders) = self.holders.get(&table) else {
            return true;
        };
        match mode {
            LockMode::Shared => holders
                .iter()
                .all(|(&t, &m)| t == txn || m == LockMode::Shared),
            LockMode::Exclusive => holders.keys().all(|&t| t == txn),
        }
    }

    fn blockers(&self, table: usize, txn: u64, mode: LockMode) -> Vec<u64> {
        let Some(holders) = self.holders.get(&table) else {
            return vec![];
        };
        holders
            .iter()
            .filter(|&(&t, &m)| t != txn && (mode == LockMode::Exclusive || m == LockMode::Exclusive))
            .map(|(&t, _)| t)
            .collect()
    }

    /// Whether granting `txn`'s recorded wait would close a cycle in the
    /// wait-for graph. Must be called with the wait already recorded so
    /// that two simultaneous requesters cannot both miss the cycle.
    fn would_deadlock(&self, txn: u64, table: usize, mode: LockMode) -> bool {
        let mut visited = HashSet::new();
        let mut frontier = self.blockers(table, txn, mode);
        while let Some(other) = frontier.pop() {
            if other == txn {
                return true;
            }
            if !visited.insert(other) {
                continue;
            }
            if let Some(&(t, m)) = self.waits.get(&other) {
                frontier.extend(self.blockers(t, other, m));
            }
        }
        false
    }
}

#[derive(Default, Debug)]
struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl LockManager {
    fn acquire(&self, txn: u64, table: usize, mode: LockMode) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.grantable(table, txn, mode) {
                let granted = state.holders.entry(table).or_default();
                let entry = granted.entry(txn).or_insert(mode);
                if mode == LockMode::Exclusive {
                    *entry = LockMode::Exclusive;
                }
                state.waits.remove(&txn);
                return Ok(());
            }
            state.waits.insert(txn, (table, mode));
            if state.would_deadlock(txn, table, mode) {
                state.waits.remove(&txn);
                return Err(KvError::Deadlock);
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn release_all(&self, txn: u64) {
        let mut state = self.state.lock().unwrap();
        state.holders.retain(|_, holders| {
            holders.remove(&txn);
            !holders.is_empty()
        });
        state.waits.remove(&txn);
        drop(state);
        self.cond.notify_all();
    }
}

#[derive(Debug)]
struct EnvInner {
    key: PathBuf,
    tables: Mutex<HashMap<String, Arc<TableInner>>>,
    next_table_id: AtomicUsize,
    next_txn_id: AtomicU64,
    locks: LockManager,
    panicked: AtomicBool,
}

/// A shared store environment. Handles opened against the same path share
/// tables, the lock manager, and the sticky panic flag.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

static ENVIRONMENTS: Lazy<Mutex<HashMap<PathBuf, Weak<EnvInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl Environment {
    /// Opens (or joins) the environment registered at `path`. The path is
    /// canonicalized so that different spellings of the same directory
    /// share one environment.
    pub fn open(path: &Path) -> Self {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut registry = ENVIRONMENTS.lock().unwrap();
        if let Some(weak) = registry.get(&key)
            && let Some(inner) = weak.upgrade()
        {
            return Self { inner };
        }
        let inner = Arc::new(EnvInner {
            key: key.clone(),
            tables: Mutex::new(HashMap::new()),
            next_table_id: AtomicUsize::new(0),
            next_txn_id: AtomicU64::new(1),
            locks: LockManager::default(),
            panicked: AtomicBool::new(false),
        });
        registry.insert(key, Arc::downgrade(&inner));
        Self { inner }
    }

    /// Opens the named table, creating it if `create` is set. Fails with
    /// `NotFound` for a missing table and `Fatal` for a kind mismatch.
    pub fn open_table(&self, name: &str, kind: TableKind, create: bool) -> KvResult<Table> {
        self.check_panic()?;
        let mut tables = self.inner.tables.lock().unwrap();
        if let Some(inner) = tables.get(name) {
            if inner.kind != kind {
                return Err(KvError::Fatal(format!(
                    "table '{name}' exists with kind {:?}, requested {kind:?}",
                    inner.kind
                )));
            }
            return Ok(Table {
                inner: inner.clone(),
            });
        }
        if !create {
            return Err(KvError::NotFound);
        }
        let inner = Arc::new(TableInner {
            id: self.inner.next_table_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            kind,
            rows: Mutex::new(TableRows::new(kind)),
        });
        tables.insert(name.to_string(), inner.clone());
        Ok(Table { inner })
    }

    /// Starts a transaction. A non-locking transaction reads committed
    /// state without taking locks and applies writes immediately (the
    /// autocommit mode used by trails opened without a store transaction).
    pub fn begin(&self, locking: bool) -> KvTransaction {
        KvTransaction {
            env: self.inner.clone(),
            id: self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed),
            locking,
            undo: Vec::new(),
            finished: false,
        }
    }

    /// Marks the environment as panicked. The flag is sticky.
    pub fn set_panicked(&self) {
        self.inner.panicked.store(true, Ordering::SeqCst);
    }

    pub fn is_panicked(&self) -> bool {
        self.inner.panicked.load(Ordering::SeqCst)
    }

    /// Explicitly requests recovery, clearing the panic flag.
    pub fn recover(&self) {
        self.inner.panicked.store(false, Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        &self.inner.key
    }

    fn check_panic(&self) -> KvResult<()> {
        if self.is_panicked() {
            Err(KvError::Panic(format!(
                "environment '{}' must be recovered",
                self.inner.key.display()
            )))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.inner.key)
            .finish()
    }
}

enum Undo {
    BtreeRestore {
        table: Arc<TableInner>,
        key: Vec<u8>,
        prev: Option<Vec<u8>>,
    },
    DupRestore {
        table: Arc<TableInner>,
        key: Vec<u8>,
        prev: Option<Vec<Vec<u8>>>,
    },
    RecnoTruncate {
        table: Arc<TableInner>,
        len: usize,
    },
    RecnoRestore {
        table: Arc<TableInner>,
        index: usize,
        prev: Vec<u8>,
    },
}

/// One store transaction. Writes are applied in place under exclusive
/// table locks with an undo log; abort rolls the log back. Dropping an
/// uncommitted transaction aborts it.
pub struct KvTransaction {
    env: Arc<EnvInner>,
    id: u64,
    locking: bool,
    undo: Vec<Undo>,
    finished: bool,
}

impl KvTransaction {
    fn check(&self) -> KvResult<()> {
        if self.env.panicked.load(Ordering::SeqCst) {
            Err(KvError::Panic(format!(
                "environment '{}' must be recovered",
                self.env.key.display()
            )))
        } else {
            Ok(())
        }
    }

    fn lock(&self, table: &Table, mode: LockMode) -> KvResult<()> {
        if !self.locking {
            return Ok(());
        }
        self.env.locks.acquire(self.id, table.inner.id, mode)
    }

    pub fn get(&self, table: &Table, key: &[u8]) -> KvResult<Vec<u8>> {
        self.check()?;
        self.lock(table, LockMode::Shared)?;
        match &*table.inner.rows.lock().unwrap() {
            TableRows::Btree(map) => map.get(key).cloned().ok_or(KvError::NotFound),
            TableRows::Dup(map) => map
                .get(key)
                .and_then(|values| values.first())
                .cloned()
                .ok_or(KvError::NotFound),
            TableRows::Recno(_) => Err(KvError::Fatal(format!(
                "keyed get on record-numbered table '{}'",
                table.name()
            ))),
        }
    }

    pub fn put(&mut self, table: &Table, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.check()?;
        self.lock(table, LockMode::Exclusive)?;
        match &mut *table.inner.rows.lock().unwrap() {
            TableRows::Btree(map) => {
                let prev = map.insert(key.to_vec(), value.to_vec());
                self.undo.push(Undo::BtreeRestore {
                    table: table.inner.clone(),
                    key: key.to_vec(),
                    prev,
                });
                Ok(())
            }
            _ => Err(KvError::Fatal(format!(
                "unique put on non-btree table '{}'",
                table.name()
            ))),
        }
    }

    pub fn delete(&mut self, table: &Table, key: &[u8]) -> KvResult<()> {
        self.check()?;
        self.lock(table, LockMode::Exclusive)?;
        match &mut *table.inner.rows.lock().unwrap() {
            TableRows::Btree(map) => match map.remove(key) {
                Some(prev) => {
                    self.undo.push(Undo::BtreeRestore {
                        table: table.inner.clone(),
                        key: key.to_vec(),
                        prev: Some(prev),
                    });
                    Ok(())
                }
                None => Err(KvError::NotFound),
            },
            _ => Err(KvError::Fatal(format!(
                "unique delete on non-btree table '{}'",
                table.name()
            ))),
        }
    }

    /// Appends one duplicate value under `key` in a duplicate-key table.
    pub fn add_dup(&mut self, table: &Table, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.check()?;
        self.lock(table, LockMode::Exclusive)?;
        match &mut *table.inner.rows.lock().unwrap() {
            TableRows::Dup(map) => {
                let prev = map.get(key).cloned();
                map.entry(key.to_vec()).or_default().push(value.to_vec());
                self.undo.push(Undo::DupRestore {
                    table: table.inner.clone(),
                    key: key.to_vec(),
                    prev,
                });
                Ok(())
            }
            _ => Err(KvError::Fatal(format!(
                "duplicate add on non-duplicate table '{}'",
                table.name()
            ))),
        }
    }

    /// All duplicate values under `key`, in insertion order. An absent key
    /// yields an empty list.
    pub fn get_dups(&self, table: &Table, key: &[u8]) -> KvResult<Vec<Vec<u8>>> {
        self.check()?;
        self.lock(table, LockMode::Shared)?;
        match &*table.inner.rows.lock().unwrap() {
            TableRows::Dup(map) => Ok(map.get(key).cloned().unwrap_or_default()),
            _ => Err(KvError::Fatal(format!(
                "duplicate get on non-duplicate table '{}'",
                table.name()
            ))),
        }
    }

    /// Removes every duplicate value under `key`. Removing an absent key is
    /// a no-op.
    pub fn delete_dups(&mut self, table: &Table, key: &[u8]) -> KvResult<()> {
        self.check()?;
        self.lock(table, LockMode::Exclusive)?;
        match &mut *table.inner.rows.lock().unwrap() {
            TableRows::Dup(map) => {
                if let Some(prev) = map.remove(key) {
                    self.undo.push(Undo::DupRestore {
                        table: table.inner.clone(),
                        key: key.to_vec(),
                        prev: Some(prev),
                    });
                }
                Ok(())
            }
            _ => Err(KvError::Fatal(format!(
                "duplicate delete on non-duplicate table '{}'",
                table.name()
            ))),
        }
    }

    /// Appends a record to a record-numbered table, returning its 1-based
    /// record number.
    pub fn append(&mut self, table: &Table, value: &[u8]) -> KvResult<u64> {
        self.check()?;
        self.lock(table, LockMode::Exclusive)?;
        match &mut *table.inner.rows.lock().unwrap() {
            TableRows::Recno(rows) => {
                self.undo.push(Undo::RecnoTruncate {
                    table: table.inner.clone(),
                    len: rows.len(),
                });
                rows.push(value.to_vec());
                Ok(rows.len() as u64)
            }
            _ => Err(KvError::Fatal(format!(
                "append on non-record-numbered table '{}'",
                table.name()
            ))),
        }
    }

    pub fn recno_get(&self, table: &Table, recno: u64) -> KvResult<Vec<u8>> {
        self.check()?;
        self.lock(table, LockMode::Shared)?;
        match &*table.inner.rows.lock().unwrap() {
            TableRows::Recno(rows) => match recno {
                0 => Err(KvError::NotFound),
                n => rows.get(n as usize - 1).cloned().ok_or(KvError::NotFound),
            },
            _ => Err(KvError::Fatal(format!(
                "record get on non-record-numbered table '{}'",
                table.name()
            ))),
        }
    }

    /// Overwrites an existing record.
    pub fn recno_put(&mut self, table: &Table, recno: u64, value: &[u8]) -> KvResult<()> {
        self.check()?;
        self.lock(table, LockMode::Exclusive)?;
        match &mut *table.inner.rows.lock().unwrap() {
            TableRows::Recno(rows) => {
                let index = recno
                    .checked_sub(1)
                    .map(|i| i as usize)
                    .filter(|&i| i < rows.len())
                    .ok_or(KvError::NotFound)?;
                let prev = std::mem::replace(&mut rows[index], value.to_vec());
                self.undo.push(Undo::RecnoRestore {
                    table: table.inner.clone(),
                    index,
                    prev,
                });
                Ok(())
            }
            _ => Err(KvError::Fatal(format!(
                "record put on non-record-numbered table '{}'",
                table.name()
            ))),
        }
    }

    /// Number of records in a record-numbered table. Holds a read lock on
    /// the table for the rest of the transaction, blocking concurrent
    /// appends; the youngest-revision serialization relies on this.
    pub fn recno_count(&self, table: &Table) -> KvResult<u64> {
        self.check()?;
        self.lock(table, LockMode::Shared)?;
        match &*table.inner.rows.lock().unwrap() {
            TableRows::Recno(rows) => Ok(rows.len() as u64),
            _ => Err(KvError::Fatal(format!(
                "record count on non-record-numbered table '{}'",
                table.name()
            ))),
        }
    }

    /// Opens a cursor over the table's current rows. The snapshot stays
    /// consistent for the rest of the transaction because the table lock is
    /// held until commit or abort.
    pub fn cursor(&self, table: &Table) -> KvResult<Cursor> {
        self.check()?;
        self.lock(table, LockMode::Shared)?;
        let rows = match &*table.inner.rows.lock().unwrap() {
            TableRows::Btree(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            TableRows::Dup(map) => map
                .iter()
                .flat_map(|(k, values)| values.iter().map(move |v| (k.clone(), v.clone())))
                .collect(),
            TableRows::Recno(rows) => rows
                .iter()
                .enumerate()
                .map(|(i, v)| ((i as u64 + 1).to_be_bytes().to_vec(), v.clone()))
                .collect(),
        };
        Ok(Cursor { rows, pos: None })
    }

    fn finish(&mut self, rollback: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if rollback {
            for undo in self.undo.drain(..).rev() {
                match undo {
                    Undo::BtreeRestore { table, key, prev } => {
                        if let TableRows::Btree(map) = &mut *table.rows.lock().unwrap() {
                            match prev {
                                Some(value) => map.insert(key, value),
                                None => map.remove(&key),
                            };
                        }
                    }
                    Undo::DupRestore { table, key, prev } => {
                        if let TableRows::Dup(map) = &mut *table.rows.lock().unwrap() {
                            match prev {
                                Some(values) => map.insert(key, values),
                                None => map.remove(&key),
                            };
                        }
                    }
                    Undo::RecnoTruncate { table, len } => {
                        if let TableRows::Recno(rows) = &mut *table.rows.lock().unwrap() {
                            rows.truncate(len);
                        }
                    }
                    Undo::RecnoRestore { table, index, prev } => {
                        if let TableRows::Recno(rows) = &mut *table.rows.lock().unwrap() {
                            rows[index] = prev;
                        }
                    }
                }
            }
        } else {
            self.undo.clear();
        }
        if self.locking {
            self.env.locks.release_all(self.id);
        }
    }

    pub fn commit(mut self) -> KvResult<()> {
        self.check()?;
        self.finish(false);
        Ok(())
    }

    pub fn abort(mut self) {
        self.finish(true);
    }
}

impl Drop for KvTransaction {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// A snapshot cursor over one table. Keys of record-numbered tables are the
/// big-endian record numbers.
pub struct Cursor {
    rows: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl Cursor {
    fn at(&self, pos: usize) -> Option<(Vec<u8>, Vec<u8>)> {
        self.rows.get(pos).cloned()
    }

    pub fn first(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.pos = Some(0);
        self.at(0)
    }

    pub fn last(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.rows.is_empty() {
            self.pos = None;
            return None;
        }
        let pos = self.rows.len() - 1;
        self.pos = Some(pos);
        self.at(pos)
    }

    pub fn next(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let pos = match self.pos {
            Some(pos) => pos + 1,
            None => 0,
        };
        self.pos = Some(pos);
        self.at(pos)
    }

    /// Advances to the next row only if it shares the current row's key.
    pub fn next_dup(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let pos = self.pos?;
        let key = self.rows.get(pos)?.0.clone();
        let next = pos + 1;
        if self.rows.get(next)?.0 != key {
            return None;
        }
        self.pos = Some(next);
        self.at(next)
    }

    /// Positions at the first row whose key is >= `key`.
    pub fn seek_range(&mut self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let pos = self.rows.partition_point(|(k, _)| k.as_slice() < key);
        self.pos = Some(pos);
        self.at(pos)
    }

    /// Deletes the row under the cursor from the underlying table.
    pub fn delete_current(&mut self, txn: &mut KvTransaction, table: &Table) -> KvResult<()> {
        let pos = self.pos.ok_or(KvError::NotFound)?;
        let (key, value) = self.rows.get(pos).cloned().ok_or(KvError::NotFound)?;
        match table.kind() {
            TableKind::Btree => txn.delete(table, &key),
            TableKind::DupBtree => {
                let mut values = txn.get_dups(table, &key)?;
                let index = values
                    .iter()
                    .position(|v| *v == value)
                    .ok_or(KvError::NotFound)?;
                values.remove(index);
                txn.delete_dups(table, &key)?;
                for v in &values {
                    txn.add_dup(table, &key, v)?;
                }
                Ok(())
            }
            TableKind::Recno => Err(KvError::Fatal(
                "cannot delete from a record-numbered table".to_string(),
            )),
        }
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use assert_matches::assert_matches;

    use super::*;

    fn test_env(name: &str) -> Environment {
        let dir = std::env::temp_dir().join(format!("strata-kv-test-{name}-{}", std::process::id()));
        Environment::open(&dir)
    }

    #[test]
    fn test_btree_put_get_delete() {
        let env = test_env("btree");
        let table = env.open_table("t", TableKind::Btree, true).unwrap();
        let mut txn = env.begin(true);
        txn.put(&table, b"k", b"v").unwrap();
        assert_eq!(txn.get(&table, b"k").unwrap(), b"v");
        txn.delete(&table, b"k").unwrap();
        assert_matches!(txn.get(&table, b"k"), Err(KvError::NotFound));
        txn.commit().unwrap();
    }

    #[test]
    fn test_abort_rolls_back() {
        let env = test_env("abort");
        let table = env.open_table("t", TableKind::Btree, true).unwrap();
        let mut txn = env.begin(true);
        txn.put(&table, b"k", b"v1").unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin(true);
        txn.put(&table, b"k", b"v2").unwrap();
        txn.put(&table, b"k2", b"other").unwrap();
        txn.abort();

        let txn = env.begin(true);
        assert_eq!(txn.get(&table, b"k").unwrap(), b"v1");
        assert_matches!(txn.get(&table, b"k2"), Err(KvError::NotFound));
    }

    #[test]
    fn test_dup_table_order() {
        let env = test_env("dup");
        let table = env.open_table("t", TableKind::DupBtree, true).unwrap();
        let mut txn = env.begin(true);
        txn.add_dup(&table, b"k", b"1").unwrap();
        txn.add_dup(&table, b"k", b"2").unwrap();
        txn.add_dup(&table, b"k", b"3").unwrap();
        assert_eq!(
            txn.get_dups(&table, b"k").unwrap(),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
        assert_eq!(txn.get_dups(&table, b"missing").unwrap(), Vec::<Vec<u8>>::new());
        txn.commit().unwrap();
    }

    #[test]
    fn test_recno_append() {
        let env = test_env("recno");
        let table = env.open_table("t", TableKind::Recno, true).unwrap();
        let mut txn = env.begin(true);
        assert_eq!(txn.append(&table, b"r1").unwrap(), 1);
        assert_eq!(txn.append(&table, b"r2").unwrap(), 2);
        assert_eq!(txn.recno_count(&table).unwrap(), 2);
        assert_eq!(txn.recno_get(&table, 2).unwrap(), b"r2");
        assert_matches!(txn.recno_get(&table, 3), Err(KvError::NotFound));
        txn.commit().unwrap();
    }

    #[test]
    fn test_cursor_seek_range_and_dups() {
        let env = test_env("cursor");
        let table = env.open_table("t", TableKind::DupBtree, true).unwrap();
        let mut txn = env.begin(true);
        txn.add_dup(&table, b"a/", b"1").unwrap();
        txn.add_dup(&table, b"a/x", b"2").unwrap();
        txn.add_dup(&table, b"a/x", b"3").unwrap();
        txn.add_dup(&table, b"b", b"4").unwrap();

        let mut cursor = txn.cursor(&table).unwrap();
        let (key, value) = cursor.seek_range(b"a/x").unwrap();
        assert_eq!((key.as_slice(), value.as_slice()), (&b"a/x"[..], &b"2"[..]));
        let (_, value) = cursor.next_dup().unwrap();
        assert_eq!(value, b"3");
        assert_matches!(cursor.next_dup(), None);
        let (key, _) = cursor.next().unwrap();
        assert_eq!(key, b"b");
        txn.commit().unwrap();
    }

    #[test]
    fn test_deadlock_detected() {
        let env = test_env("deadlock");
        let table_a = env.open_table("a", TableKind::Btree, true).unwrap();
        let table_b = env.open_table("b", TableKind::Btree, true).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let run = |first: Table, second: Table, env: Environment, barrier: Arc<Barrier>| {
            move || -> KvResult<()> {
                let mut txn = env.begin(true);
                txn.put(&first, b"k", b"v")?;
                barrier.wait();
                let result = txn.put(&second, b"k", b"v");
                match result {
                    Ok(()) => {
                        txn.commit()?;
                        Ok(())
                    }
                    Err(err) => {
                        txn.abort();
                        Err(err)
                    }
                }
            }
        };

        let t1 = std::thread::spawn(run(
            table_a.clone(),
            table_b.clone(),
            env.clone(),
            barrier.clone(),
        ));
        let t2 = std::thread::spawn(run(table_b, table_a, env, barrier));
        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        let deadlocks = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Err(KvError::Deadlock)))
            .count();
        assert_eq!(deadlocks, 1, "exactly one victim: {r1:?} {r2:?}");
    }

    #[test]
    fn test_panic_is_sticky() {
        let env = test_env("panic");
        let table = env.open_table("t", TableKind::Btree, true).unwrap();
        env.set_panicked();
        let txn = env.begin(true);
        assert_matches!(txn.get(&table, b"k"), Err(KvError::Panic(_)));
        env.recover();
        let txn = env.begin(true);
        assert_matches!(txn.get(&table, b"k"), Err(KvError::NotFound));
    }
}
