//! Tree head resolution and encoding

use crate::error::{StorageError, StorageResult};
use crate::key_utils::{make_tree_head_prefix, make_tree_head_row_key};
use crate::traits::{Mutation, ReadScope, Row, Table};
use crate::types::{DigitallySigned, TreeHead, TreeMetadata};
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;

/// Columns of a `TreeHeads` row. The signature and metadata are stored as
/// their own serialized blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeHeadRow {
    pub tree_id: i64,
    pub ts_nanos: u64,
    pub tree_size: u64,
    pub root_hash: Vec<u8>,
    pub root_signature: Vec<u8>,
    pub tree_revision: i64,
    pub tree_metadata: Vec<u8>,
}

impl TreeHeadRow {
    pub fn from_tree_head(head: &TreeHead) -> StorageResult<Self> {
        if head.revision < 0 {
            return Err(StorageError::InvalidArgument(format!(
                "tree head revision {} is negative",
                head.revision
            )));
        }
        let tree_metadata = match &head.metadata {
            Some(meta) => bincode::serialize(meta)?,
            None => Vec::new(),
        };
        Ok(Self {
            tree_id: head.tree_id,
            ts_nanos: head.ts_nanos,
            tree_size: head.tree_size,
            root_hash: head.root_hash.clone(),
            root_signature: bincode::serialize(&head.signature)?,
            tree_revision: head.revision,
            tree_metadata,
        })
    }

    pub fn into_tree_head(self) -> StorageResult<TreeHead> {
        let signature: DigitallySigned = if self.root_signature.is_empty() {
            DigitallySigned::default()
        } else {
            bincode::deserialize(&self.root_signature)?
        };
        let metadata: Option<TreeMetadata> = if self.tree_metadata.is_empty() {
            None
        } else {
            Some(bincode::deserialize(&self.tree_metadata)?)
        };
        Ok(TreeHead {
            tree_id: self.tree_id,
            revision: self.tree_revision,
            ts_nanos: self.ts_nanos,
            tree_size: self.tree_size,
            root_hash: self.root_hash,
            signature,
            metadata,
        })
    }
}

/// Mutation inserting `head` into the `TreeHeads` table.
pub fn tree_head_mutation(head: &TreeHead) -> StorageResult<Mutation> {
    let row = TreeHeadRow::from_tree_head(head)?;
    Ok(Mutation::insert(
        Table::TreeHeads,
        make_tree_head_row_key(head.tree_id, head.ts_nanos),
        bincode::serialize(&row)?,
    ))
}

/// Reads the newest tree head (by timestamp) visible to `scope`.
///
/// Fails with [`StorageError::TreeNeedsInit`] when the tree has no head yet.
pub async fn latest_tree_head(scope: &dyn ReadScope, tree_id: i64) -> StorageResult<TreeHead> {
    let mut head: Option<TreeHead> = None;
    let mut visit = |row: Row| -> StorageResult<ControlFlow<()>> {
        let cols: TreeHeadRow = bincode::deserialize(&row.value)?;
        if cols.tree_id != tree_id {
            return Err(StorageError::DataIntegrity(format!(
                "tree head row for tree {} found under tree {}",
                cols.tree_id, tree_id
            )));
        }
        head = Some(cols.into_tree_head()?);
        Ok(ControlFlow::Break(()))
    };
    scope
        .read_prefix(Table::TreeHeads, &make_tree_head_prefix(tree_id), &mut visit)
        .await?;

    match head {
        Some(head) => {
            trace!(
                "latest head for tree {} is revision {} (size {})",
                tree_id,
                head.revision,
                head.tree_size
            );
            Ok(head)
        }
        None => {
            warn!("no head found for tree {}", tree_id);
            Err(StorageError::TreeNeedsInit(tree_id))
        }
    }
}
