//! RocksDB implementation of the treeshrew backend traits
//!
//! All tables share one keyspace; each row key is prefixed with its table
//! name. Read-only scopes read the latest state: staleness is accepted and
//! ignored. Commits are serialized so that `Insert` conflict checks and the
//! batch write happen atomically.

use crate::optimized_config::create_optimized_options;
use async_trait::async_trait;
use log::{debug, info, trace};
use rocksdb::{Options, WriteBatch, DB};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use treeshrew_runtime::key_utils::make_table_key;
use treeshrew_runtime::{
    Mutation, ReadScope, Row, RowVisitor, StorageBackend, StorageError, StorageResult, Table,
    WriteScope,
};

fn backend_err(err: rocksdb::Error) -> StorageError {
    StorageError::Backend(format!("rocksdb: {}", err))
}

#[derive(Clone)]
pub struct RocksTreeDb {
    pub db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
}

impl RocksTreeDb {
    pub fn open<P: AsRef<Path>>(path: P, opts: Options) -> StorageResult<Self> {
        let db = DB::open(&opts, path.as_ref()).map_err(backend_err)?;
        info!("opened tree database at {}", path.as_ref().display());
        Ok(Self::from_db(Arc::new(db)))
    }

    /// Opens `path` with [`create_optimized_options`].
    pub fn open_optimized<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::open(path, create_optimized_options())
    }

    pub fn from_db(db: Arc<DB>) -> Self {
        Self {
            db,
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    fn read_row(&self, table: Table, key: &[u8]) -> StorageResult<Option<Row>> {
        let value = self
            .db
            .get(make_table_key(table, key))
            .map_err(backend_err)?;
        Ok(value.map(|value| Row {
            key: key.to_vec(),
            value,
        }))
    }

    fn read_prefix(&self, table: Table, prefix: &[u8], visit: &mut RowVisitor<'_>) -> StorageResult<()> {
        let table_prefix_len = make_table_key(table, &[]).len();
        let start = make_table_key(table, prefix);

        let mut iter = self.db.raw_iterator();
        iter.seek(&start);
        while iter.valid() {
            let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                break;
            };
            if !key.starts_with(&start) {
                break;
            }
            trace!("{} row {}", table.name(), hex::encode(&key[table_prefix_len..]));
            let row = Row {
                key: key[table_prefix_len..].to_vec(),
                value: value.to_vec(),
            };
            if let ControlFlow::Break(()) = visit(row)? {
                return Ok(());
            }
            iter.next();
        }
        iter.status().map_err(backend_err)
    }

    fn apply(&self, mutations: Vec<Mutation>) -> StorageResult<()> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|e| StorageError::Backend(format!("commit lock poisoned: {}", e)))?;

        let mut batch = WriteBatch::default();
        let mut seen = HashSet::new();
        for mutation in &mutations {
            let key = make_table_key(mutation.table(), mutation.key());
            if !seen.insert(key.clone()) || self.db.get_pinned(&key).map_err(backend_err)?.is_some() {
                return Err(StorageError::AlreadyExists(format!(
                    "{} row {}",
                    mutation.table().name(),
                    hex::encode(mutation.key())
                )));
            }
            let Mutation::Insert { value, .. } = mutation;
            batch.put(&key, value);
        }
        self.db.write(batch).map_err(backend_err)?;
        debug!("committed {} mutations", mutations.len());
        Ok(())
    }
}

pub struct RocksReadScope {
    db: RocksTreeDb,
    open: AtomicBool,
}

pub struct RocksWriteScope {
    db: RocksTreeDb,
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
impl ReadScope for RocksReadScope {
    async fn read_row(&self, table: Table, key: &[u8]) -> StorageResult<Option<Row>> {
        check_open(&self.open)?;
        self.db.read_row(table, key)
    }

    async fn read_prefix(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut RowVisitor<'_>,
    ) -> StorageResult<()> {
        check_open(&self.open)?;
        self.db.read_prefix(table, prefix, visit)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadScope for RocksWriteScope {
    async fn read_row(&self, table: Table, key: &[u8]) -> StorageResult<Option<Row>> {
        check_open(&self.open)?;
        self.db.read_row(table, key)
    }

    async fn read_prefix(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut RowVisitor<'_>,
    ) -> StorageResult<()> {
        check_open(&self.open)?;
        self.db.read_prefix(table, prefix, visit)
    }

    async fn close(&self) {
        self.rollback().await;
    }
}

#[async_trait]
impl WriteScope for RocksWriteScope {
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
        self.db.apply(mutations)
    }

    async fn rollback(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut buffered) = self.buffered.lock() {
            buffered.clear();
        }
    }
}

#[async_trait]
impl StorageBackend for RocksTreeDb {
    type ReadOnly = RocksReadScope;
    type ReadWrite = RocksWriteScope;

    async fn begin_read_only(&self, staleness: Duration) -> StorageResult<RocksReadScope> {
        if !staleness.is_zero() {
            trace!("rocksdb reads latest state, ignoring staleness {:?}", staleness);
        }
        Ok(RocksReadScope {
            db: self.clone(),
            open: AtomicBool::new(true),
        })
    }

    async fn begin_read_write(&self) -> StorageResult<RocksWriteScope> {
        Ok(RocksWriteScope {
            db: self.clone(),
            buffered: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })
    }

    async fn ping(&self) -> StorageResult<()> {
        self.db
            .property_value("rocksdb.estimate-num-keys")
            .map(|_| ())
            .map_err(backend_err)
    }
}
