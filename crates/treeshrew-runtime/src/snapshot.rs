//! Read-only snapshot transactions not bound to a single tree

use crate::error::{StorageError, StorageResult};
use crate::traits::ReadScope;
use crate::tree_head::latest_tree_head;
use crate::types::TreeHead;
use log::info;
use tokio::sync::RwLock;

pub struct SnapshotTx {
    scope: RwLock<Option<Box<dyn ReadScope>>>,
}

impl SnapshotTx {
    pub(crate) fn new<R: ReadScope + 'static>(scope: R) -> Self {
        Self {
            scope: RwLock::new(Some(Box::new(scope))),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.scope.read().await.is_some()
    }

    /// Newest tree head of `tree_id` visible in this snapshot.
    pub async fn latest_tree_head(&self, tree_id: i64) -> StorageResult<TreeHead> {
        let guard = self.scope.read().await;
        let scope = guard.as_ref().ok_or(StorageError::TransactionClosed)?;
        latest_tree_head(scope.as_ref(), tree_id).await
    }

    pub async fn commit(&self) -> StorageResult<()> {
        self.close().await
    }

    pub async fn rollback(&self) -> StorageResult<()> {
        self.close().await
    }

    /// Releases the snapshot. Fails with `TransactionClosed` if it was
    /// already released.
    pub async fn close(&self) -> StorageResult<()> {
        let scope = self
            .scope
            .write()
            .await
            .take()
            .ok_or(StorageError::TransactionClosed)?;
        info!("closing snapshot");
        scope.close().await;
        Ok(())
    }
}
