//! Revisioned subtree reads and writes

use crate::cache::SubtreeFetcher;
use crate::error::{StorageError, StorageResult};
use crate::key_utils::{make_subtree_prefix, make_subtree_row_key, subtree_key};
use crate::traits::{Mutation, ReadScope, Row, Table};
use crate::types::{NodeId, SubtreeRecord};
use async_trait::async_trait;
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Columns of a `SubtreeData` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtreeRow {
    pub revision: i64,
    pub subtree: Vec<u8>,
}

/// Mutation inserting `record` at `revision`. Internal nodes are not stored.
pub fn subtree_mutation(tree_id: i64, revision: i64, record: &SubtreeRecord) -> StorageResult<Mutation> {
    let stored = record.for_storage();
    let row = SubtreeRow {
        revision,
        subtree: stored.encode()?,
    };
    Ok(Mutation::insert(
        Table::SubtreeData,
        make_subtree_row_key(tree_id, stored.prefix_bytes(), revision)?,
        bincode::serialize(&row)?,
    ))
}

/// Reads the newest version of the subtree rooted at `id` written at or
/// before `revision`. Returns `None` if no such version exists.
pub async fn read_subtree(
    scope: &dyn ReadScope,
    tree_id: i64,
    revision: i64,
    id: &NodeId,
) -> StorageResult<Option<SubtreeRecord>> {
    let key = subtree_key(id)?;
    let prefix = make_subtree_prefix(tree_id, &key)?;

    // Rows arrive newest revision first, so the first visible row wins.
    let mut found: Option<SubtreeRecord> = None;
    let mut visit = |row: Row| -> StorageResult<ControlFlow<()>> {
        let cols: SubtreeRow = bincode::deserialize(&row.value)?;
        if cols.revision > revision {
            trace!(
                "skipping subtree {} at revision {} (reading at {})",
                hex::encode(&key),
                cols.revision,
                revision
            );
            return Ok(ControlFlow::Continue(()));
        }
        let mut record = SubtreeRecord::decode(&cols.subtree)?;
        if record.prefix_bytes() != key.as_slice() {
            return Err(StorageError::DataIntegrity(format!(
                "got subtree with prefix {}, wanted {}",
                hex::encode(record.prefix_bytes()),
                hex::encode(&key)
            )));
        }
        if record.prefix.is_none() && key.is_empty() {
            record.prefix = Some(Vec::new());
        }
        found = Some(record);
        Ok(ControlFlow::Break(()))
    };
    scope
        .read_prefix(Table::SubtreeData, &prefix, &mut visit)
        .await?;
    Ok(found)
}

/// Fetches subtrees as of one fixed revision.
pub struct RevisionFetcher {
    scope: Arc<dyn ReadScope>,
    tree_id: i64,
    revision: i64,
}

impl RevisionFetcher {
    pub fn new(scope: Arc<dyn ReadScope>, tree_id: i64, revision: i64) -> Self {
        Self {
            scope,
            tree_id,
            revision,
        }
    }
}

#[async_trait]
impl SubtreeFetcher for RevisionFetcher {
    /// One task per distinct subtree. Every task is joined before returning;
    /// the first failure observed is returned and all results are dropped.
    async fn fetch_subtrees(&self, ids: &[NodeId]) -> StorageResult<Vec<SubtreeRecord>> {
        let mut seen = HashSet::new();
        let mut distinct = Vec::with_capacity(ids.len());
        for id in ids {
            if seen.insert(subtree_key(id)?) {
                distinct.push(id.clone());
            }
        }

        let mut tasks = JoinSet::new();
        for id in distinct {
            let scope = Arc::clone(&self.scope);
            let (tree_id, revision) = (self.tree_id, self.revision);
            tasks.spawn(async move { read_subtree(scope.as_ref(), tree_id, revision, &id).await });
        }

        let mut first_err: Option<StorageError> = None;
        let mut subtrees = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(subtree))) => subtrees.push(subtree),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(StorageError::Backend(format!(
                        "subtree fetch task failed: {}",
                        e
                    )));
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(subtrees),
        }
    }

    async fn fetch_subtree(&self, id: &NodeId) -> StorageResult<Option<SubtreeRecord>> {
        read_subtree(self.scope.as_ref(), self.tree_id, self.revision, id).await
    }
}
