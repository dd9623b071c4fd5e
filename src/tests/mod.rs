//! Scenario tests for treeshrew storage
//!
//! Every scenario is written once, generic over the backend, and run
//! against `MemTreeDb` and `RocksTreeDb`.

use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;
use treeshrew_mem::MemTreeDb;
use treeshrew_rocksdb::RocksTreeDb;
use treeshrew_runtime::{
    AdminStorage, BackendAdmin, GetOpts, Node, NodeId, StorageBackend, Tree, TreeHead,
    TreeStorage, TreeStorageOptions, TreeType,
};


pub const TEST_TREE_ID: i64 = 1001;

/// A backend, its admin table and a `TreeStorage` over both.
pub struct TestTrees<B: StorageBackend> {
    pub backend: Arc<B>,
    pub admin: Arc<BackendAdmin<B>>,
    pub storage: TreeStorage<B>,
}

impl<B: StorageBackend> TestTrees<B> {
    pub fn new(backend: B, options: TreeStorageOptions) -> Self {
        let backend = Arc::new(backend);
        let admin = Arc::new(BackendAdmin::new(backend.clone()));
        let storage = TreeStorage::new(
            backend.clone(),
            admin.clone() as Arc<dyn AdminStorage>,
            options,
        );
        Self {
            backend,
            admin,
            storage,
        }
    }

    /// Registers a log tree and stores its revision 0 head.
    pub async fn init_log_tree(&self, tree_id: i64) -> Result<()> {
        self.admin.create_tree(&Tree::new(tree_id, TreeType::Log)).await?;
        let tx = self.storage.begin_read_write(tree_id, &GetOpts::log(false)).await?;
        tx.store_tree_head(&head(tree_id, 0)).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Writes `nodes` and a new head in one transaction. Returns the revision
    /// they were written at.
    pub async fn advance(&self, tree_id: i64, nodes: &[Node]) -> Result<i64> {
        let tx = self.storage.begin_read_write(tree_id, &GetOpts::log(false)).await?;
        let revision = tx.write_revision().await?;
        tx.set_merkle_nodes(nodes).await?;
        tx.store_tree_head(&head(tree_id, revision)).await?;
        tx.commit().await?;
        log::debug!("tree {} advanced to revision {}", tree_id, revision);
        Ok(revision)
    }

    /// Reads `ids` at `revision` in a fresh read-only transaction.
    pub async fn nodes_at(&self, tree_id: i64, revision: i64, ids: &[NodeId]) -> Result<Vec<Node>> {
        let tx = self.storage.begin_read_only(tree_id, &GetOpts::log(true)).await?;
        let nodes = tx.get_merkle_nodes(revision, ids).await;
        tx.close().await?;
        Ok(nodes?)
    }
}

pub fn mem_trees() -> TestTrees<MemTreeDb> {
    TestTrees::new(MemTreeDb::new(), TreeStorageOptions::default())
}

pub fn rocks_trees() -> Result<(TempDir, TestTrees<RocksTreeDb>)> {
    let dir = TempDir::new()?;
    let db = RocksTreeDb::open_optimized(dir.path())?;
    Ok((dir, TestTrees::new(db, TreeStorageOptions::default())))
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Head at `revision`; timestamps follow revisions so newer heads sort first.
pub fn head(tree_id: i64, revision: i64) -> TreeHead {
    TreeHead {
        tree_id,
        revision,
        ts_nanos: 1_000 + revision as u64,
        tree_size: revision as u64,
        root_hash: vec![revision as u8; 32],
        ..Default::default()
    }
}

/// Byte-aligned node id covering all of `path`.
pub fn leaf(path: &[u8]) -> NodeId {
    NodeId::from_prefix(path)
}

pub fn hash(seed: u8) -> Vec<u8> {
    vec![seed; 32]
}
