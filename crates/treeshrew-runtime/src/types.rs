//! Core data model shared by transactions, the subtree cache and backends

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logical identifier of a Merkle node: the first `prefix_len_bits` bits of
/// `path`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    path: Vec<u8>,
    prefix_len_bits: usize,
}

impl NodeId {
    pub fn new(path: Vec<u8>, prefix_len_bits: usize) -> StorageResult<Self> {
        if prefix_len_bits > path.len() * 8 {
            return Err(StorageError::InvalidArgument(format!(
                "prefix_len_bits {} exceeds path of {} bytes",
                prefix_len_bits,
                path.len()
            )));
        }
        Ok(Self {
            path,
            prefix_len_bits,
        })
    }

    /// Byte-aligned id covering every bit of `prefix`.
    pub fn from_prefix(prefix: &[u8]) -> Self {
        Self {
            path: prefix.to_vec(),
            prefix_len_bits: prefix.len() * 8,
        }
    }

    /// The root of the tree.
    pub fn root() -> Self {
        Self::from_prefix(&[])
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn prefix_len_bits(&self) -> usize {
        self.prefix_len_bits
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.prefix_len_bits % 8 == 0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}/{})", hex::encode(&self.path), self.prefix_len_bits)
    }
}

/// A node hash addressed by its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_id: NodeId,
    pub hash: Vec<u8>,
}

impl Node {
    pub fn new(node_id: NodeId, hash: Vec<u8>) -> Self {
        Self { node_id, hash }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    None,
    Sha256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[default]
    Anonymous,
    Rsa,
    Ecdsa,
    Ed25519,
}

/// Signature over a tree head. The scheme itself is opaque to storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitallySigned {
    pub hash_algorithm: HashAlgorithm,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature: Vec<u8>,
}

/// Opaque, self-describing metadata attached to a tree head.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    pub type_url: String,
    pub value: Vec<u8>,
}

/// A committed, signed tree state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeHead {
    pub tree_id: i64,
    pub revision: i64,
    pub ts_nanos: u64,
    pub tree_size: u64,
    pub root_hash: Vec<u8>,
    pub signature: DigitallySigned,
    pub metadata: Option<TreeMetadata>,
}

/// Physical storage unit holding the node hashes of one subtree.
///
/// `leaves` holds hashes at the bottom of the subtree, `internal_nodes`
/// everything above it. Internal nodes are derivable from the leaves and are
/// never persisted (see [`SubtreeRecord::for_storage`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeRecord {
    /// Byte-aligned prefix of the subtree root. An empty prefix is persisted
    /// unset.
    pub prefix: Option<Vec<u8>>,
    /// Depth of the subtree in bits.
    pub depth: u32,
    pub root_hash: Vec<u8>,
    pub leaves: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub internal_nodes: BTreeMap<String, Vec<u8>>,
}

impl SubtreeRecord {
    pub fn new(prefix: Vec<u8>, depth: u32) -> Self {
        Self {
            prefix: Some(prefix),
            depth,
            ..Default::default()
        }
    }

    pub fn prefix_bytes(&self) -> &[u8] {
        self.prefix.as_deref().unwrap_or(&[])
    }

    /// Copy suitable for durable storage: no internal nodes, and an empty
    /// prefix left unset.
    pub fn for_storage(&self) -> Self {
        Self {
            prefix: self.prefix.clone().filter(|p| !p.is_empty()),
            depth: self.depth,
            root_hash: self.root_hash.clone(),
            leaves: self.leaves.clone(),
            internal_nodes: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
