//! In-memory MVCC implementation of the treeshrew backend traits
//!
//! Every committed write keeps its version, tagged with a logical commit
//! number. Read-only scopes read the newest versions committed at least
//! `staleness` ago; read-write scopes read the newest committed versions and
//! apply their buffered mutations under one commit number.

use async_trait::async_trait;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use treeshrew_runtime::key_utils::make_table_key;
use treeshrew_runtime::{
    Mutation, ReadScope, Row, RowVisitor, StorageBackend, StorageError, StorageResult, Table,
    WriteScope,
};

#[derive(Default)]
struct MemState {
    /// Table-qualified key to `(commit, value)` versions, oldest first.
    rows: BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>>,
    /// Number of the last commit; 0 before the first.
    clock: u64,
    /// Wall time of commit `n` at index `n - 1`.
    commit_times: Vec<Instant>,
}

impl MemState {
    fn commit_at_or_before(&self, cutoff: Option<Instant>) -> u64 {
        match cutoff {
            Some(cutoff) => self.commit_times.partition_point(|t| *t <= cutoff) as u64,
            None => 0,
        }
    }

    fn value_at(versions: &[(u64, Vec<u8>)], at: u64) -> Option<&Vec<u8>> {
        versions
            .iter()
            .rev()
            .find(|(commit, _)| *commit <= at)
            .map(|(_, value)| value)
    }
}

#[derive(Default)]
struct TestHooks {
    failing_prefixes: Mutex<Vec<(Table, Vec<u8>)>>,
    reads: AtomicUsize,
}

/// Shared in-memory database. Clones share state.
#[derive(Clone, Default)]
pub struct MemTreeDb {
    state: Arc<RwLock<MemState>>,
    hooks: Arc<TestHooks>,
}

impl MemTreeDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_state(&self) -> StorageResult<RwLockReadGuard<'_, MemState>> {
        self.state
            .read()
            .map_err(|e| StorageError::Backend(format!("mem db lock poisoned: {}", e)))
    }

    fn write_state(&self) -> StorageResult<RwLockWriteGuard<'_, MemState>> {
        self.state
            .write()
            .map_err(|e| StorageError::Backend(format!("mem db lock poisoned: {}", e)))
    }

    /// Number of the last commit.
    pub fn clock(&self) -> StorageResult<u64> {
        Ok(self.read_state()?.clock)
    }

    /// Number of distinct rows ever written.
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.read_state()?.rows.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Makes every later prefix read in `table` starting with `prefix` fail.
    pub fn fail_reads_with_prefix(&self, table: Table, prefix: Vec<u8>) -> StorageResult<()> {
        self.hooks
            .failing_prefixes
            .lock()
            .map_err(|e| StorageError::Backend(format!("hook lock poisoned: {}", e)))?
            .push((table, prefix));
        Ok(())
    }

    /// Reads served so far, point and prefix.
    pub fn reads(&self) -> usize {
        self.hooks.reads.load(Ordering::SeqCst)
    }

    fn check_injected_failure(&self, table: Table, prefix: &[u8]) -> StorageResult<()> {
        let failing = self
            .hooks
            .failing_prefixes
            .lock()
            .map_err(|e| StorageError::Backend(format!("hook lock poisoned: {}", e)))?;
        if failing
            .iter()
            .any(|(t, p)| *t == table && prefix.starts_with(p))
        {
            return Err(StorageError::Backend(format!(
                "injected read failure on {} prefix {}",
                table.name(),
                hex::encode(prefix)
            )));
        }
        Ok(())
    }

    /// Resolves the commit a read runs at: `None` means the latest.
    fn snapshot(&self, read_at: Option<u64>) -> StorageResult<(RwLockReadGuard<'_, MemState>, u64)> {
        let state = self.read_state()?;
        let at = read_at.unwrap_or(state.clock);
        Ok((state, at))
    }

    fn read_row_at(&self, read_at: Option<u64>, table: Table, key: &[u8]) -> StorageResult<Option<Row>> {
        self.hooks.reads.fetch_add(1, Ordering::SeqCst);
        let (state, at) = self.snapshot(read_at)?;
        Ok(state
            .rows
            .get(&make_table_key(table, key))
            .and_then(|versions| MemState::value_at(versions, at))
            .map(|value| Row {
                key: key.to_vec(),
                value: value.clone(),
            }))
    }

    fn read_prefix_at(
        &self,
        read_at: Option<u64>,
        table: Table,
        prefix: &[u8],
        visit: &mut RowVisitor<'_>,
    ) -> StorageResult<()> {
        self.hooks.reads.fetch_add(1, Ordering::SeqCst);
        self.check_injected_failure(table, prefix)?;

        let table_prefix = make_table_key(table, &[]);
        let start = make_table_key(table, prefix);
        let rows: Vec<Row> = {
            let (state, at) = self.snapshot(read_at)?;
            state
                .rows
                .range(start.clone()..)
                .take_while(|(key, _)| key.starts_with(&start))
                .filter_map(|(key, versions)| {
                    MemState::value_at(versions, at).map(|value| Row {
                        key: key[table_prefix.len()..].to_vec(),
                        value: value.clone(),
                    })
                })
                .collect()
        };

        for row in rows {
            trace!("{} row {}", table.name(), hex::encode(&row.key));
            if let ControlFlow::Break(()) = visit(row)? {
                break;
            }
        }
        Ok(())
    }

    fn apply(&self, mutations: Vec<Mutation>) -> StorageResult<u64> {
        let mut state = self.write_state()?;

        let mut keys: Vec<Vec<u8>> = mutations
            .iter()
            .map(|m| make_table_key(m.table(), m.key()))
            .collect();
        for (key, mutation) in keys.iter().zip(&mutations) {
            if state.rows.contains_key(key) {
                return Err(StorageError::AlreadyExists(format!(
                    "{} row {}",
                    mutation.table().name(),
                    hex::encode(mutation.key())
                )));
            }
        }
        keys.sort();
        if keys.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(StorageError::AlreadyExists(
                "row inserted twice in one commit".to_string(),
            ));
        }

        state.clock += 1;
        let commit = state.clock;
        state.commit_times.push(Instant::now());
        for mutation in mutations {
            let Mutation::Insert { table, key, value } = mutation;
            state
                .rows
                .entry(make_table_key(table, &key))
                .or_default()
                .push((commit, value));
        }
        Ok(commit)
    }
}

/// Scope reading at a fixed past commit.
pub struct MemReadScope {
    db: MemTreeDb,
    read_at: u64,
    open: AtomicBool,
}

/// Scope reading the latest committed state and buffering inserts.
pub struct MemWriteScope {
    db: MemTreeDb,
    buffered: Mutex<Vec<Mutation>>,
    open: AtomicBool,
}

fn check_open(open: &AtomicBool) -> StorageResult<()> {
    if open.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(StorageError::Backend("scope already released".to_string()))
    }
}

#[async_trait]
impl ReadScope for MemReadScope {
    async fn read_row(&self, table: Table, key: &[u8]) -> StorageResult<Option<Row>> {
        check_open(&self.open)?;
        self.db.read_row_at(Some(self.read_at), table, key)
    }

    async fn read_prefix(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut RowVisitor<'_>,
    ) -> StorageResult<()> {
        check_open(&self.open)?;
        self.db.read_prefix_at(Some(self.read_at), table, prefix, visit)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadScope for MemWriteScope {
    async fn read_row(&self, table: Table, key: &[u8]) -> StorageResult<Option<Row>> {
        check_open(&self.open)?;
        self.db.read_row_at(None, table, key)
    }

    async fn read_prefix(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut RowVisitor<'_>,
    ) -> StorageResult<()> {
        check_open(&self.open)?;
        self.db.read_prefix_at(None, table, prefix, visit)
    }

    async fn close(&self) {
        self.rollback().await;
    }
}

#[async_trait]
impl WriteScope for MemWriteScope {
    fn buffer_write(&self, mutations: Vec<Mutation>) -> StorageResult<()> {
        check_open(&self.open)?;
        self.buffered
            .lock()
            .map_err(|e| StorageError::Backend(format!("buffer lock poisoned: {}", e)))?
            .extend(mutations);
        Ok(())
    }

    async fn commit(&self) -> StorageResult<()> {
        check_open(&self.open)?;
        self.open.store(false, Ordering::SeqCst);
        let mutations = std::mem::take(
            &mut *self
                .buffered
                .lock()
                .map_err(|e| StorageError::Backend(format!("buffer lock poisoned: {}", e)))?,
        );
        let count = mutations.len();
        let commit = self.db.apply(mutations)?;
        debug!("commit {} applied {} mutations", commit, count);
        Ok(())
    }

    async fn rollback(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut buffered) = self.buffered.lock() {
            buffered.clear();
        }
    }
}

#[async_trait]
impl StorageBackend for MemTreeDb {
    type ReadOnly = MemReadScope;
    type ReadWrite = MemWriteScope;

    async fn begin_read_only(&self, staleness: Duration) -> StorageResult<MemReadScope> {
        let state = self.read_state()?;
        let read_at = if staleness.is_zero() {
            state.clock
        } else {
            state.commit_at_or_before(Instant::now().checked_sub(staleness))
        };
        trace!("read-only scope at commit {} of {}", read_at, state.clock);
        Ok(MemReadScope {
            db: self.clone(),
            read_at,
            open: AtomicBool::new(true),
        })
    }

    async fn begin_read_write(&self) -> StorageResult<MemWriteScope> {
        Ok(MemWriteScope {
            db: self.clone(),
            buffered: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })
    }

    async fn ping(&self) -> StorageResult<()> {
        self.read_state().map(|_| ())
    }
}
