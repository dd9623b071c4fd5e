//! Entry point for opening tree transactions
//!
//! [`TreeStorage`] ties a [`StorageBackend`] to the admin lookup and the
//! cache factory. Every `begin_*` call validates the tree, decodes its
//! storage settings and builds a fresh cache before the backend scope is
//! opened, so a rejected tree never costs a database transaction.

use crate::admin::{get_tree, unmarshal_settings, AdminStorage, GetOpts, StorageSettings, Tree};
use crate::cache::{CacheFactory, StratumCacheFactory, SubtreeCache};
use crate::config::TreeStorageOptions;
use crate::error::StorageResult;
use crate::snapshot::SnapshotTx;
use crate::traits::StorageBackend;
use crate::tx::{ReadOnlyTreeTx, ReadWriteTreeTx, TreeTx, TxScope};
use log::debug;
use std::sync::Arc;

pub struct TreeStorage<B: StorageBackend> {
    backend: Arc<B>,
    admin: Arc<dyn AdminStorage>,
    options: TreeStorageOptions,
    cache_factory: Arc<dyn CacheFactory>,
}

impl<B: StorageBackend> TreeStorage<B> {
    pub fn new(backend: Arc<B>, admin: Arc<dyn AdminStorage>, options: TreeStorageOptions) -> Self {
        Self {
            backend,
            admin,
            options,
            cache_factory: Arc::new(StratumCacheFactory::default()),
        }
    }

    async fn prepare(
        &self,
        tree_id: i64,
        opts: &GetOpts,
    ) -> StorageResult<(Tree, StorageSettings, Box<dyn SubtreeCache>)> {
        let tree = get_tree(self.admin.as_ref(), tree_id, opts).await?;
        let config = unmarshal_settings(&tree)?;
        let cache = self.cache_factory.new_cache(&tree)?;
        Ok((tree, config, cache))
    }

    /// Opens a read-only transaction on `tree_id`, reading
    /// `read_only_staleness` in the past.
    pub async fn begin_read_only(&self, tree_id: i64, opts: &GetOpts) -> StorageResult<ReadOnlyTreeTx> {
        let opts = GetOpts {
            read_only: true,
            ..opts.clone()
        };
        let (tree, config, cache) = self.prepare(tree_id, &opts).await?;
        let scope = self
            .backend
            .begin_read_only(self.options.read_only_staleness)
            .await?;
        debug!("began read-only tx on tree {}", tree_id);
        Ok(ReadOnlyTreeTx::new(TreeTx::new(
            tree,
            config,
            TxScope::read_only(scope),
            cache,
        )))
    }

    /// Opens a read-write transaction on `tree_id`.
    pub async fn begin_read_write(&self, tree_id: i64, opts: &GetOpts) -> StorageResult<ReadWriteTreeTx> {
        let opts = GetOpts {
            read_only: false,
            ..opts.clone()
        };
        let (tree, config, cache) = self.prepare(tree_id, &opts).await?;
        let scope = self.backend.begin_read_write().await?;
        debug!("began read-write tx on tree {}", tree_id);
        Ok(ReadWriteTreeTx::new(TreeTx::new(
            tree,
            config,
            TxScope::read_write(scope),
            cache,
        )))
    }

    /// Opens a read-only snapshot spanning every tree.
    pub async fn snapshot(&self) -> StorageResult<SnapshotTx> {
        let scope = self
            .backend
            .begin_read_only(self.options.read_only_staleness)
            .await?;
        Ok(SnapshotTx::new(scope))
    }

    pub async fn check_database_accessible(&self) -> StorageResult<()> {
        self.backend.ping().await
    }
}
