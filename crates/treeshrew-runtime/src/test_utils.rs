//! Scripted in-memory backend for unit tests
//!
//! Rows live in one ordered map shared by every scope; there is no
//! isolation between scopes. Tests seed rows directly, inject read failures
//! and delays, and inspect what was committed.

use crate::admin::{AdminStorage, Tree};
use crate::error::{StorageError, StorageResult};
use crate::subtree::subtree_mutation;
use crate::traits::{Mutation, ReadScope, Row, RowVisitor, StorageBackend, Table, WriteScope};
use crate::tree_head::tree_head_mutation;
use crate::types::{SubtreeRecord, TreeHead};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct ScriptState {
    rows: Mutex<BTreeMap<(Table, Vec<u8>), Vec<u8>>>,
    committed: Mutex<Vec<Mutation>>,
    failing_prefixes: Mutex<Vec<(Table, Vec<u8>, StorageError)>>,
    fail_commit: Mutex<Option<StorageError>>,
    read_delay: Mutex<Duration>,
    attempted: Mutex<Vec<Mutation>>,
    tree_head_reads: AtomicUsize,
    completed_reads: AtomicUsize,
    rollbacks: AtomicUsize,
    commits: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<ScriptState>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, mutation: Mutation) {
        let Mutation::Insert { table, key, value } = mutation;
        self.state.rows.lock().unwrap().insert((table, key), value);
    }

    pub fn put_tree_head(&self, head: &TreeHead) {
        self.apply(tree_head_mutation(head).unwrap());
    }

    pub fn put_subtree(&self, tree_id: i64, revision: i64, record: &SubtreeRecord) {
        self.apply(subtree_mutation(tree_id, revision, record).unwrap());
    }

    pub fn put_row(&self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.apply(Mutation::insert(table, key, value));
    }

    /// Every prefix read in `table` whose prefix starts with `prefix` fails
    /// with `err`, without waiting out the read delay.
    pub fn fail_reads_with_prefix(&self, table: Table, prefix: Vec<u8>, err: StorageError) {
        self.state
            .failing_prefixes
            .lock()
            .unwrap()
            .push((table, prefix, err));
    }

    pub fn fail_next_commit(&self, err: StorageError) {
        *self.state.fail_commit.lock().unwrap() = Some(err);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.state.read_delay.lock().unwrap() = delay;
    }

    pub fn tree_head_reads(&self) -> usize {
        self.state.tree_head_reads.load(Ordering::SeqCst)
    }

    /// Prefix reads that ran to the end without an injected failure.
    pub fn completed_reads(&self) -> usize {
        self.state.completed_reads.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// Mutations applied by successful commits, in order.
    pub fn committed(&self) -> Vec<Mutation> {
        self.state.committed.lock().unwrap().clone()
    }

    /// Mutations buffered by the most recent commit, whether or not it
    /// succeeded.
    pub fn last_commit_attempt(&self) -> Vec<Mutation> {
        self.state.attempted.lock().unwrap().clone()
    }

    pub fn scope(&self) -> ScriptedScope {
        ScriptedScope {
            state: self.state.clone(),
            buffered: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }
}

pub struct ScriptedScope {
    state: Arc<ScriptState>,
    buffered: Mutex<Vec<Mutation>>,
    open: AtomicBool,
}

impl ScriptedScope {
    fn check_open(&self) -> StorageResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Backend("scope already released".to_string()))
        }
    }
}

#[async_trait]
impl ReadScope for ScriptedScope {
    async fn read_row(&self, table: Table, key: &[u8]) -> StorageResult<Option<Row>> {
        self.check_open()?;
        let rows = self.state.rows.lock().unwrap();
        Ok(rows.get(&(table, key.to_vec())).map(|value| Row {
            key: key.to_vec(),
            value: value.clone(),
        }))
    }

    async fn read_prefix(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut RowVisitor<'_>,
    ) -> StorageResult<()> {
        self.check_open()?;
        if table == Table::TreeHeads {
            self.state.tree_head_reads.fetch_add(1, Ordering::SeqCst);
        }
        let failure = self
            .state
            .failing_prefixes
            .lock()
            .unwrap()
            .iter()
            .find(|(t, p, _)| *t == table && prefix.starts_with(p))
            .map(|(_, _, err)| err.clone());
        if let Some(err) = failure {
            return Err(err);
        }
        let delay = *self.state.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let matching: Vec<Row> = self
            .state
            .rows
            .lock()
            .unwrap()
            .range((table, prefix.to_vec())..)
            .take_while(|((t, key), _)| *t == table && key.starts_with(prefix))
            .map(|((_, key), value)| Row {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        for row in matching {
            if visit(row)?.is_break() {
                break;
            }
        }
        self.state.completed_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl WriteScope for ScriptedScope {
    fn buffer_write(&self, mutations: Vec<Mutation>) -> StorageResult<()> {
        self.check_open()?;
        self.buffered.lock().unwrap().extend(mutations);
        Ok(())
    }

    async fn commit(&self) -> StorageResult<()> {
        self.check_open()?;
        self.open.store(false, Ordering::SeqCst);
        if let Some(err) = self.state.fail_commit.lock().unwrap().take() {
            return Err(err);
        }
        let buffered = std::mem::take(&mut *self.buffered.lock().unwrap());
        *self.state.attempted.lock().unwrap() = buffered.clone();
        let mut rows = self.state.rows.lock().unwrap();
        for mutation in &buffered {
            if rows.contains_key(&(mutation.table(), mutation.key().to_vec())) {
                return Err(StorageError::AlreadyExists(hex::encode(mutation.key())));
            }
        }
        for mutation in &buffered {
            let Mutation::Insert { table, key, value } = mutation.clone();
            rows.insert((table, key), value);
        }
        self.state.committed.lock().unwrap().extend(buffered);
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.buffered.lock().unwrap().clear();
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for ScriptedBackend {
    type ReadOnly = ScriptedScope;
    type ReadWrite = ScriptedScope;

    async fn begin_read_only(&self, _staleness: Duration) -> StorageResult<ScriptedScope> {
        Ok(self.scope())
    }

    async fn begin_read_write(&self) -> StorageResult<ScriptedScope> {
        Ok(self.scope())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Admin lookup over a fixed set of trees.
#[derive(Default)]
pub struct StaticAdmin {
    trees: HashMap<i64, Tree>,
}

impl StaticAdmin {
    pub fn new(trees: impl IntoIterator<Item = Tree>) -> Self {
        Self {
            trees: trees.into_iter().map(|tree| (tree.tree_id, tree)).collect(),
        }
    }
}

#[async_trait]
impl AdminStorage for StaticAdmin {
    async fn get_tree(&self, tree_id: i64) -> StorageResult<Tree> {
        self.trees
            .get(&tree_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("tree {}", tree_id)))
    }
}

pub fn tree_head(tree_id: i64, revision: i64, ts_nanos: u64) -> TreeHead {
    TreeHead {
        tree_id,
        revision,
        ts_nanos,
        tree_size: revision as u64,
        root_hash: vec![revision as u8; 32],
        ..Default::default()
    }
}

