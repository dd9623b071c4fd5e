//! Tree transactions
//!
//! A [`TreeTx`] scopes one unit of work against a single tree. It owns a
//! backend scope and a subtree cache, resolves the tree's current head at
//! most once, serves node reads through the cache and, for read-write
//! transactions, flushes buffered subtrees on commit.
//!
//! Callers get one of two typed fronts: [`ReadOnlyTreeTx`] or
//! [`ReadWriteTreeTx`]. Mutating methods only exist on the latter; the
//! runtime check on the scope kind stays as a backstop.

use crate::admin::{StorageSettings, Tree};
use crate::cache::SubtreeCache;
use crate::error::{StorageError, StorageResult};
use crate::subtree::{subtree_mutation, RevisionFetcher};
use crate::traits::{ReadScope, WriteScope};
use crate::tree_head::{latest_tree_head, tree_head_mutation};
use crate::types::{Node, NodeId, SubtreeRecord, TreeHead};
use log::{debug, trace, warn};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// The backend scope a transaction runs in.
pub(crate) enum TxScope {
    ReadOnly(Arc<dyn ReadScope>),
    ReadWrite {
        reader: Arc<dyn ReadScope>,
        writer: Arc<dyn WriteScope>,
    },
}

impl TxScope {
    pub(crate) fn read_only<R: ReadScope + 'static>(scope: R) -> Self {
        TxScope::ReadOnly(Arc::new(scope))
    }

    pub(crate) fn read_write<W: WriteScope + 'static>(scope: W) -> Self {
        let scope = Arc::new(scope);
        TxScope::ReadWrite {
            reader: scope.clone(),
            writer: scope,
        }
    }

    fn reader(&self) -> &Arc<dyn ReadScope> {
        match self {
            TxScope::ReadOnly(reader) => reader,
            TxScope::ReadWrite { reader, .. } => reader,
        }
    }

    fn writer(&self) -> StorageResult<&Arc<dyn WriteScope>> {
        match self {
            TxScope::ReadOnly(_) => Err(StorageError::WrongTransactionType),
            TxScope::ReadWrite { writer, .. } => Ok(writer),
        }
    }
}

/// Revision the next write after `head` is stored at.
fn next_revision(head: &TreeHead) -> StorageResult<i64> {
    head.revision.checked_add(1).ok_or_else(|| {
        StorageError::DataIntegrity(format!(
            "tree {} head at revision {} has no successor",
            head.tree_id, head.revision
        ))
    })
}

pub struct TreeTx {
    tree: Tree,
    config: StorageSettings,
    /// `None` once committed or rolled back.
    scope: RwLock<Option<TxScope>>,
    cache: Box<dyn SubtreeCache>,
    /// Newest tree head visible when first asked for, or why there is none.
    latest_root: OnceCell<StorageResult<TreeHead>>,
}

impl TreeTx {
    pub(crate) fn new(
        tree: Tree,
        config: StorageSettings,
        scope: TxScope,
        cache: Box<dyn SubtreeCache>,
    ) -> Self {
        Self {
            tree,
            config,
            scope: RwLock::new(Some(scope)),
            cache,
            latest_root: OnceCell::new(),
        }
    }

    pub fn tree_id(&self) -> i64 {
        self.tree.tree_id
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn config(&self) -> &StorageSettings {
        &self.config
    }

    /// True until Commit or Rollback has been called.
    pub async fn is_open(&self) -> bool {
        self.scope.read().await.is_some()
    }

    async fn latest_root(&self, reader: &dyn ReadScope) -> StorageResult<&TreeHead> {
        self.latest_root
            .get_or_init(|| async {
                let head = latest_tree_head(reader, self.tree_id()).await;
                if let Ok(head) = &head {
                    debug!("tree {} resolved at revision {}", self.tree_id(), head.revision);
                }
                head
            })
            .await
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Resolves the current head through the open scope. A closed
    /// transaction fails even if the head was resolved before closing.
    async fn resolved_root(&self) -> StorageResult<&TreeHead> {
        let guard = self.scope.read().await;
        let scope = guard.as_ref().ok_or(StorageError::TransactionClosed)?;
        self.latest_root(scope.reader().as_ref()).await
    }

    /// The newest tree head visible to this transaction.
    pub async fn current_tree_head(&self) -> StorageResult<TreeHead> {
        self.resolved_root().await.cloned()
    }

    /// Revision of the newest visible tree head.
    pub async fn read_revision(&self) -> StorageResult<i64> {
        Ok(self.resolved_root().await?.revision)
    }

    /// Revision any tree modification made through this transaction will
    /// be stored at.
    pub async fn write_revision(&self) -> StorageResult<i64> {
        next_revision(self.resolved_root().await?)
    }

    /// Returns the requested nodes as of `revision`. Nodes without a stored
    /// hash are left out.
    pub async fn get_merkle_nodes(&self, revision: i64, ids: &[NodeId]) -> StorageResult<Vec<Node>> {
        let guard = self.scope.read().await;
        let scope = guard.as_ref().ok_or(StorageError::TransactionClosed)?;
        let fetcher = RevisionFetcher::new(scope.reader().clone(), self.tree_id(), revision);
        self.cache.get_nodes(ids, &fetcher).await
    }

    pub(crate) async fn set_merkle_nodes(&self, nodes: &[Node]) -> StorageResult<()> {
        let guard = self.scope.read().await;
        let scope = guard.as_ref().ok_or(StorageError::TransactionClosed)?;
        scope.writer()?;

        let reader = scope.reader();
        let write_rev = next_revision(self.latest_root(reader.as_ref()).await?)?;
        // Subtrees missing from the cache are loaded as of the last
        // committed revision.
        let fetcher = RevisionFetcher::new(reader.clone(), self.tree_id(), write_rev - 1);
        for node in nodes {
            self.cache
                .set_node_hash(&node.node_id, node.hash.clone(), &fetcher)
                .await?;
        }
        trace!("buffered {} nodes at revision {}", nodes.len(), write_rev);
        Ok(())
    }

    pub(crate) async fn store_tree_head(&self, head: &TreeHead) -> StorageResult<()> {
        let guard = self.scope.read().await;
        let scope = guard.as_ref().ok_or(StorageError::TransactionClosed)?;
        let writer = scope.writer()?;

        if head.tree_id != self.tree_id() {
            return Err(StorageError::InvalidArgument(format!(
                "tree head for tree {} stored through transaction on tree {}",
                head.tree_id,
                self.tree_id()
            )));
        }
        let want = match self.latest_root(scope.reader().as_ref()).await {
            Ok(current) => next_revision(current)?,
            Err(StorageError::TreeNeedsInit(_)) => 0,
            Err(e) => return Err(e),
        };
        if head.revision != want {
            return Err(StorageError::InvalidArgument(format!(
                "tree head at revision {}, want {}",
                head.revision, want
            )));
        }
        writer.buffer_write(vec![tree_head_mutation(head)?])
    }

    fn flush_subtrees(&self, writer: &dyn WriteScope) -> StorageResult<()> {
        let tree_id = self.tree_id();
        let write_rev = match self.latest_root.get() {
            Some(Ok(head)) => Some(next_revision(head)?),
            _ => None,
        };
        self.cache
            .flush(&mut |subtrees: Vec<SubtreeRecord>| -> StorageResult<()> {
                let write_rev = write_rev.ok_or_else(|| {
                    StorageError::FailedPrecondition(
                        "dirty subtrees without a resolved write revision".to_string(),
                    )
                })?;
                let mut mutations = Vec::with_capacity(subtrees.len());
                for subtree in &subtrees {
                    if subtree.leaves.is_empty() {
                        trace!(
                            "subtree {} holds no leaves, not stored",
                            hex::encode(subtree.prefix_bytes())
                        );
                        continue;
                    }
                    mutations.push(subtree_mutation(tree_id, write_rev, subtree)?);
                }
                debug!(
                    "flushing {} subtrees of tree {} at revision {}",
                    mutations.len(),
                    tree_id,
                    write_rev
                );
                writer.buffer_write(mutations)
            })
    }

    /// Applies everything done in this transaction. The transaction is
    /// closed on return, whether or not the commit succeeded; if it failed,
    /// nothing read through this transaction may be trusted.
    pub async fn commit(&self) -> StorageResult<()> {
        let mut guard = self.scope.write().await;
        let scope = guard.take().ok_or(StorageError::TransactionClosed)?;
        match scope {
            TxScope::ReadOnly(reader) => {
                reader.close().await;
                debug!("closed read-only tx on tree {}", self.tree_id());
                Ok(())
            }
            TxScope::ReadWrite { writer, .. } => {
                if let Err(e) = self.flush_subtrees(writer.as_ref()) {
                    writer.rollback().await;
                    return Err(e);
                }
                writer.commit().await
            }
        }
    }

    /// Abandons everything done in this transaction and closes it.
    pub async fn rollback(&self) -> StorageResult<()> {
        let mut guard = self.scope.write().await;
        match guard.take().ok_or(StorageError::TransactionClosed)? {
            TxScope::ReadOnly(reader) => reader.close().await,
            TxScope::ReadWrite { writer, .. } => writer.rollback().await,
        }
        debug!("rolled back tx on tree {}", self.tree_id());
        Ok(())
    }

    /// Rolls back if still open. Closing a closed transaction is not an
    /// error.
    pub async fn close(&self) -> StorageResult<()> {
        if !self.is_open().await {
            return Ok(());
        }
        match self.rollback().await {
            Ok(()) | Err(StorageError::TransactionClosed) => Ok(()),
            Err(e) => {
                warn!("rollback error on close: {}", e);
                Err(e)
            }
        }
    }
}

/// Transaction that can only read.
pub struct ReadOnlyTreeTx {
    inner: TreeTx,
}

impl ReadOnlyTreeTx {
    pub(crate) fn new(inner: TreeTx) -> Self {
        Self { inner }
    }
}

impl Deref for ReadOnlyTreeTx {
    type Target = TreeTx;

    fn deref(&self) -> &TreeTx {
        &self.inner
    }
}

/// Transaction whose writes are applied atomically on commit.
pub struct ReadWriteTreeTx {
    inner: TreeTx,
}

impl ReadWriteTreeTx {
    pub(crate) fn new(inner: TreeTx) -> Self {
        Self { inner }
    }

    /// Buffers new hashes for `nodes` at the write revision. Nothing reaches
    /// storage before [`TreeTx::commit`].
    pub async fn set_merkle_nodes(&self, nodes: &[Node]) -> StorageResult<()> {
        self.inner.set_merkle_nodes(nodes).await
    }

    /// Buffers a new tree head. Its revision must be the write revision, or
    /// 0 for a tree that has never had a head.
    pub async fn store_tree_head(&self, head: &TreeHead) -> StorageResult<()> {
        self.inner.store_tree_head(head).await
    }
}

impl Deref for ReadWriteTreeTx {
    type Target = TreeTx;

    fn deref(&self) -> &TreeTx {
        &self.inner
    }
}
