//! Transactional subtree storage for verifiable Merkle trees
//!
//! Maps logical tree operations (read and write node hashes, read and write
//! tree heads) onto transactions of any backend implementing the scope
//! traits in [`traits`].

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod key_utils;
pub mod snapshot;
pub mod storage;
pub mod subtree;
pub mod traits;
pub mod tree_head;
pub mod tx;
pub mod types;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
pub mod tests;

pub use admin::{
    get_tree, unmarshal_settings, AdminStorage, BackendAdmin, GetOpts, LogStorageConfig,
    MapStorageConfig, StorageSettings, Tree, TreeState, TreeType,
};
pub use cache::{CacheFactory, StratumCacheFactory, StratumSubtreeCache, SubtreeCache, SubtreeFetcher};
pub use config::{CacheOptions, TreeStorageOptions};
pub use error::{StorageError, StorageResult};
pub use snapshot::SnapshotTx;
pub use storage::TreeStorage;
pub use traits::{Mutation, ReadScope, Row, RowVisitor, StorageBackend, Table, WriteScope};
pub use tree_head::latest_tree_head;
pub use tx::{ReadOnlyTreeTx, ReadWriteTreeTx, TreeTx};
pub use types::{DigitallySigned, Node, NodeId, SubtreeRecord, TreeHead, TreeMetadata};
