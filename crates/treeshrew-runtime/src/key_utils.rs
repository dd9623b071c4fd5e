//! Row key construction
//!
//! Keys are raw big-endian bytes so that the backend's ascending key order is
//! also the order the readers want:
//! - `SubtreeData`: `tree_id ‖ len(subtree_key) ‖ subtree_key ‖ !revision`
//! - `TreeHeads`:   `tree_id ‖ !ts_nanos`
//! - `Trees`:       `tree_id`
//!
//! `!x` is the bitwise complement, so newer revisions and timestamps sort
//! first. The length byte keeps prefix reads for one subtree key from seeing
//! rows of a longer key that happens to extend it.

use crate::error::{StorageError, StorageResult};
use crate::traits::Table;
use crate::types::NodeId;

/// Longest subtree key the row layout can carry.
pub const MAX_SUBTREE_KEY_LEN: usize = u8::MAX as usize;

/// Returns the storage key of the subtree rooted at `id`.
///
/// Only byte-aligned ids name subtree boundaries.
pub fn subtree_key(id: &NodeId) -> StorageResult<Vec<u8>> {
    if !id.is_byte_aligned() {
        return Err(StorageError::UnalignedPrefix {
            prefix_len_bits: id.prefix_len_bits(),
        });
    }
    Ok(id.path()[..id.prefix_len_bits() / 8].to_vec())
}

/// Prefix shared by every revision of one subtree.
#[inline]
pub fn make_subtree_prefix(tree_id: i64, subtree_key: &[u8]) -> StorageResult<Vec<u8>> {
    if subtree_key.len() > MAX_SUBTREE_KEY_LEN {
        return Err(StorageError::InvalidArgument(format!(
            "subtree key of {} bytes exceeds {}",
            subtree_key.len(),
            MAX_SUBTREE_KEY_LEN
        )));
    }
    let mut result = Vec::with_capacity(8 + 1 + subtree_key.len() + 8);
    result.extend_from_slice(&tree_id.to_be_bytes());
    result.push(subtree_key.len() as u8);
    result.extend_from_slice(subtree_key);
    Ok(result)
}

#[inline]
pub fn make_subtree_row_key(tree_id: i64, subtree_key: &[u8], revision: i64) -> StorageResult<Vec<u8>> {
    let mut result = make_subtree_prefix(tree_id, subtree_key)?;
    result.extend_from_slice(&invert_revision(revision)?);
    Ok(result)
}

#[inline]
pub fn make_tree_head_prefix(tree_id: i64) -> Vec<u8> {
    tree_id.to_be_bytes().to_vec()
}

#[inline]
pub fn make_tree_head_row_key(tree_id: i64, ts_nanos: u64) -> Vec<u8> {
    let mut result = Vec::with_capacity(16);
    result.extend_from_slice(&tree_id.to_be_bytes());
    result.extend_from_slice(&(!ts_nanos).to_be_bytes());
    result
}

#[inline]
pub fn make_tree_row_key(tree_id: i64) -> Vec<u8> {
    tree_id.to_be_bytes().to_vec()
}

/// Physical key for backends sharing one keyspace between tables.
#[inline]
pub fn make_table_key(table: Table, key: &[u8]) -> Vec<u8> {
    let name = table.name().as_bytes();
    let mut result = Vec::with_capacity(name.len() + 1 + key.len());
    result.extend_from_slice(name);
    result.push(b'/');
    result.extend_from_slice(key);
    result
}

fn invert_revision(revision: i64) -> StorageResult<[u8; 8]> {
    if revision < 0 {
        return Err(StorageError::InvalidArgument(format!(
            "negative revision {}",
            revision
        )));
    }
    Ok((!(revision as u64)).to_be_bytes())
}
