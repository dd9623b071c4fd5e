//! Backend scope traits
//!
//! Transactions never talk to a database directly. They are handed a scope:
//! a [`ReadScope`] for snapshot reads, or a [`WriteScope`] which additionally
//! buffers mutations and applies them atomically on commit. A
//! [`StorageBackend`] opens scopes. This lets the same transaction logic run
//! over the in-memory MVCC store, RocksDB, or a scripted test double.

use crate::error::StorageResult;
use async_trait::async_trait;
use std::ops::ControlFlow;
use std::time::Duration;

/// Logical tables of the persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Trees,
    TreeHeads,
    SubtreeData,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Trees => "Trees",
            Table::TreeHeads => "TreeHeads",
            Table::SubtreeData => "SubtreeData",
        }
    }
}

/// A single stored row: its key within the table and its encoded columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A buffered write, applied when the owning scope commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Fails the whole commit if the row already exists.
    Insert {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl Mutation {
    pub fn insert(table: Table, key: Vec<u8>, value: Vec<u8>) -> Self {
        Mutation::Insert { table, key, value }
    }

    pub fn table(&self) -> Table {
        match self {
            Mutation::Insert { table, .. } => *table,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Insert { key, .. } => key,
        }
    }
}

/// Callback invoked once per row of a prefix read. Returning
/// `ControlFlow::Break` ends the read early; errors abort it.
pub type RowVisitor<'a> = dyn FnMut(Row) -> StorageResult<ControlFlow<()>> + Send + 'a;

/// Read capability scoped to one logical transaction.
#[async_trait]
pub trait ReadScope: Send + Sync {
    /// Point read of a single row.
    async fn read_row(&self, table: Table, key: &[u8]) -> StorageResult<Option<Row>>;

    /// Visit every row whose key starts with `prefix`, in ascending key
    /// order, until the visitor breaks or the rows run out.
    async fn read_prefix(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut RowVisitor<'_>,
    ) -> StorageResult<()>;

    /// Release the scope. Further reads fail.
    async fn close(&self);
}

/// Read-write capability: reads plus buffered mutations committed atomically.
#[async_trait]
pub trait WriteScope: ReadScope {
    fn buffer_write(&self, mutations: Vec<Mutation>) -> StorageResult<()>;

    /// Apply every buffered mutation atomically and release the scope.
    async fn commit(&self) -> StorageResult<()>;

    /// Discard buffered mutations and release the scope.
    async fn rollback(&self);
}

/// A database able to open transaction scopes.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    type ReadOnly: ReadScope + 'static;
    type ReadWrite: WriteScope + 'static;

    /// Open a read-only scope reading `staleness` in the past.
    async fn begin_read_only(&self, staleness: Duration) -> StorageResult<Self::ReadOnly>;

    async fn begin_read_write(&self) -> StorageResult<Self::ReadWrite>;

    /// Cheap round trip proving the database is reachable.
    async fn ping(&self) -> StorageResult<()>;
}
