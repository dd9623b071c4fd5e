//! Tree metadata lookup
//!
//! Transactions are only started for trees the admin layer knows about. The
//! lookup also enforces the caller's expectations: which tree types are
//! acceptable and whether write access is needed.

use crate::error::{StorageError, StorageResult};
use crate::key_utils::make_tree_row_key;
use crate::traits::{Mutation, ReadScope, StorageBackend, Table, WriteScope};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeType {
    Log,
    PreorderedLog,
    Map,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeState {
    #[default]
    Active,
    Frozen,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub tree_id: i64,
    pub tree_type: TreeType,
    pub tree_state: TreeState,
    pub deleted: bool,
    pub display_name: String,
    /// Encoded [`StorageSettings`]; `None` means the defaults for the type.
    pub storage_settings: Option<Vec<u8>>,
}

impl Tree {
    pub fn new(tree_id: i64, tree_type: TreeType) -> Self {
        Self {
            tree_id,
            tree_type,
            tree_state: TreeState::Active,
            deleted: false,
            display_name: String::new(),
            storage_settings: None,
        }
    }

    pub fn with_state(mut self, state: TreeState) -> Self {
        self.tree_state = state;
        self
    }

    pub fn with_settings(mut self, settings: &StorageSettings) -> StorageResult<Self> {
        self.storage_settings = Some(bincode::serialize(settings)?);
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStorageConfig {
    pub num_unseq_buckets: i64,
    pub num_merkle_buckets: i64,
}

impl Default for LogStorageConfig {
    fn default() -> Self {
        Self {
            num_unseq_buckets: 4,
            num_merkle_buckets: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStorageConfig {
    pub num_merkle_buckets: i64,
}

impl Default for MapStorageConfig {
    fn default() -> Self {
        Self {
            num_merkle_buckets: 16,
        }
    }
}

/// Per-tree storage settings, by tree type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageSettings {
    Log(LogStorageConfig),
    Map(MapStorageConfig),
}

/// Decodes the storage settings carried by `tree`, or the defaults for its
/// type.
pub fn unmarshal_settings(tree: &Tree) -> StorageResult<StorageSettings> {
    let settings = match &tree.storage_settings {
        Some(bytes) => bincode::deserialize(bytes)?,
        None => match tree.tree_type {
            TreeType::Log | TreeType::PreorderedLog => {
                StorageSettings::Log(LogStorageConfig::default())
            }
            TreeType::Map => StorageSettings::Map(MapStorageConfig::default()),
        },
    };
    let matches_type = matches!(
        (&settings, tree.tree_type),
        (StorageSettings::Log(_), TreeType::Log | TreeType::PreorderedLog)
            | (StorageSettings::Map(_), TreeType::Map)
    );
    if !matches_type {
        return Err(StorageError::InvalidArgument(format!(
            "tree {} of type {:?} carries {:?}",
            tree.tree_id, tree.tree_type, settings
        )));
    }
    Ok(settings)
}

/// What the caller of [`get_tree`] expects of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOpts {
    pub tree_types: Vec<TreeType>,
    pub read_only: bool,
}

impl GetOpts {
    pub fn new(tree_types: &[TreeType], read_only: bool) -> Self {
        Self {
            tree_types: tree_types.to_vec(),
            read_only,
        }
    }

    pub fn log(read_only: bool) -> Self {
        Self::new(&[TreeType::Log, TreeType::PreorderedLog], read_only)
    }

    pub fn map(read_only: bool) -> Self {
        Self::new(&[TreeType::Map], read_only)
    }
}

#[async_trait]
pub trait AdminStorage: Send + Sync {
    /// Returns the stored metadata of `tree_id`, deleted or not.
    async fn get_tree(&self, tree_id: i64) -> StorageResult<Tree>;
}

/// Looks up `tree_id` and checks it against `opts`.
pub async fn get_tree(admin: &dyn AdminStorage, tree_id: i64, opts: &GetOpts) -> StorageResult<Tree> {
    let tree = admin.get_tree(tree_id).await?;
    if tree.deleted {
        return Err(StorageError::NotFound(format!("tree {} is deleted", tree_id)));
    }
    if !opts.tree_types.contains(&tree.tree_type) {
        return Err(StorageError::InvalidArgument(format!(
            "tree {} is of type {:?}, want one of {:?}",
            tree_id, tree.tree_type, opts.tree_types
        )));
    }
    if !opts.read_only && tree.tree_state == TreeState::Frozen {
        return Err(StorageError::FailedPrecondition(format!(
            "tree {} is frozen",
            tree_id
        )));
    }
    Ok(tree)
}

/// [`AdminStorage`] keeping tree metadata in the backend's `Trees` table.
pub struct BackendAdmin<B: StorageBackend> {
    backend: Arc<B>,
}

impl<B: StorageBackend> BackendAdmin<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Registers a new tree. Fails with `AlreadyExists` if the id is taken.
    pub async fn create_tree(&self, tree: &Tree) -> StorageResult<()> {
        let scope = self.backend.begin_read_write().await?;
        let value = match bincode::serialize(tree) {
            Ok(value) => value,
            Err(e) => {
                scope.rollback().await;
                return Err(e.into());
            }
        };
        if let Err(e) = scope.buffer_write(vec![Mutation::insert(
            Table::Trees,
            make_tree_row_key(tree.tree_id),
            value,
        )]) {
            scope.rollback().await;
            return Err(e);
        }
        scope.commit().await?;
        debug!("created {:?} tree {}", tree.tree_type, tree.tree_id);
        Ok(())
    }
}

#[async_trait]
impl<B: StorageBackend> AdminStorage for BackendAdmin<B> {
    async fn get_tree(&self, tree_id: i64) -> StorageResult<Tree> {
        let scope = self.backend.begin_read_only(Duration::ZERO).await?;
        let row = scope.read_row(Table::Trees, &make_tree_row_key(tree_id)).await;
        scope.close().await;
        match row? {
            Some(row) => Ok(bincode::deserialize(&row.value)?),
            None => Err(StorageError::NotFound(format!("tree {}", tree_id))),
        }
    }
}
