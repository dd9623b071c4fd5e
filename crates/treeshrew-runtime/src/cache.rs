//! Subtree cache capability
//!
//! Transactions read and write individual node hashes, but storage only
//! understands whole subtrees. A [`SubtreeCache`] bridges the two: it maps
//! node ids onto the subtree owning them, asks a [`SubtreeFetcher`] for the
//! subtrees it does not hold yet, buffers hash updates and finally hands the
//! dirty subtrees to a writer on flush.
//!
//! [`StratumSubtreeCache`] cuts the tree into fixed byte-aligned strata. It
//! does not rehash: whatever is set is what is read back.

use crate::admin::Tree;
use crate::config::CacheOptions;
use crate::error::{StorageError, StorageResult};
use crate::types::{Node, NodeId, SubtreeRecord};
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Loads subtrees from storage on behalf of a cache.
#[async_trait]
pub trait SubtreeFetcher: Send + Sync {
    /// Fetches every subtree in `ids` (byte-aligned subtree roots). Subtrees
    /// that were never written are simply absent from the result.
    async fn fetch_subtrees(&self, ids: &[NodeId]) -> StorageResult<Vec<SubtreeRecord>>;

    /// Fetches the single subtree rooted at `id`.
    async fn fetch_subtree(&self, id: &NodeId) -> StorageResult<Option<SubtreeRecord>>;
}

/// Receives the dirty subtrees of a cache on flush.
pub type SubtreeSink<'a> = dyn FnMut(Vec<SubtreeRecord>) -> StorageResult<()> + Send + 'a;

#[async_trait]
pub trait SubtreeCache: Send + Sync {
    /// Returns the nodes in `ids` that have a hash, fetching missing subtrees
    /// through `fetcher`.
    async fn get_nodes(&self, ids: &[NodeId], fetcher: &dyn SubtreeFetcher) -> StorageResult<Vec<Node>>;

    /// Records a new hash for `id`, loading its subtree through `fetcher`
    /// when it is not cached.
    async fn set_node_hash(
        &self,
        id: &NodeId,
        hash: Vec<u8>,
        fetcher: &dyn SubtreeFetcher,
    ) -> StorageResult<()>;

    /// Hands every dirty subtree to `sink`, then marks them clean.
    fn flush(&self, sink: &mut SubtreeSink<'_>) -> StorageResult<()>;
}

/// Builds the cache a new transaction will own.
pub trait CacheFactory: Send + Sync {
    fn new_cache(&self, tree: &Tree) -> StorageResult<Box<dyn SubtreeCache>>;
}

#[derive(Debug, Clone, Default)]
pub struct StratumCacheFactory {
    options: CacheOptions,
}

impl StratumCacheFactory {
    pub fn new(options: CacheOptions) -> Self {
        Self { options }
    }
}

impl CacheFactory for StratumCacheFactory {
    fn new_cache(&self, tree: &Tree) -> StorageResult<Box<dyn SubtreeCache>> {
        debug!(
            "new {}-byte stratum cache for {:?} tree {}",
            self.options.stratum_bytes, tree.tree_type, tree.tree_id
        );
        Ok(Box::new(StratumSubtreeCache::new(self.options.stratum_bytes)?))
    }
}

struct CachedSubtree {
    record: SubtreeRecord,
    dirty: bool,
}

/// Where a node lives: the subtree root and the node's suffix below it.
struct Placement {
    subtree: NodeId,
    suffix: String,
    is_leaf: bool,
}

pub struct StratumSubtreeCache {
    stratum_bytes: usize,
    subtrees: Mutex<HashMap<Vec<u8>, CachedSubtree>>,
}

impl StratumSubtreeCache {
    pub fn new(stratum_bytes: usize) -> StorageResult<Self> {
        if stratum_bytes == 0 {
            return Err(StorageError::InvalidArgument(
                "stratum must be at least one byte deep".to_string(),
            ));
        }
        Ok(Self {
            stratum_bytes,
            subtrees: Mutex::new(HashMap::new()),
        })
    }

    fn depth_bits(&self) -> usize {
        self.stratum_bytes * 8
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<Vec<u8>, CachedSubtree>>> {
        self.subtrees
            .lock()
            .map_err(|e| StorageError::Backend(format!("subtree cache lock poisoned: {}", e)))
    }

    /// Nodes at a stratum boundary belong to the subtree above them, as its
    /// leaves. The tree root is the only node of the root subtree with an
    /// empty suffix.
    fn place(&self, id: &NodeId) -> Placement {
        let bits = id.prefix_len_bits();
        let depth = self.depth_bits();
        let prefix_bits = if bits == 0 { 0 } else { ((bits - 1) / depth) * depth };
        let prefix_bytes = prefix_bits / 8;
        let suffix_bits = bits - prefix_bits;

        let mut suffix = id.path()[prefix_bytes..(bits + 7) / 8].to_vec();
        if bits % 8 != 0 {
            if let Some(last) = suffix.last_mut() {
                *last &= 0xffu8 << (8 - bits % 8);
            }
        }

        Placement {
            subtree: NodeId::from_prefix(&id.path()[..prefix_bytes]),
            suffix: format!("{:02x}{}", suffix_bits, hex::encode(suffix)),
            is_leaf: suffix_bits == depth,
        }
    }

    fn empty_subtree(&self, prefix: &[u8]) -> SubtreeRecord {
        SubtreeRecord::new(prefix.to_vec(), self.depth_bits() as u32)
    }
}

fn lookup(record: &SubtreeRecord, placement: &Placement) -> Option<Vec<u8>> {
    let map = if placement.is_leaf {
        &record.leaves
    } else {
        &record.internal_nodes
    };
    map.get(&placement.suffix).cloned()
}

#[async_trait]
impl SubtreeCache for StratumSubtreeCache {
    async fn get_nodes(&self, ids: &[NodeId], fetcher: &dyn SubtreeFetcher) -> StorageResult<Vec<Node>> {
        let placements: Vec<Placement> = ids.iter().map(|id| self.place(id)).collect();

        let missing: Vec<NodeId> = {
            let subtrees = self.lock()?;
            placements
                .iter()
                .filter(|p| !subtrees.contains_key(p.subtree.path()))
                .map(|p| p.subtree.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        if !missing.is_empty() {
            trace!("cache miss on {} subtrees", missing.len());
            let fetched = fetcher.fetch_subtrees(&missing).await?;
            let mut subtrees = self.lock()?;
            for record in fetched {
                subtrees
                    .entry(record.prefix_bytes().to_vec())
                    .or_insert(CachedSubtree {
                        record,
                        dirty: false,
                    });
            }
            // Remember never-written subtrees so they are not fetched again.
            for id in &missing {
                subtrees
                    .entry(id.path().to_vec())
                    .or_insert_with(|| CachedSubtree {
                        record: self.empty_subtree(id.path()),
                        dirty: false,
                    });
            }
        }

        let subtrees = self.lock()?;
        let mut nodes = Vec::with_capacity(ids.len());
        for (id, placement) in ids.iter().zip(&placements) {
            let hash = subtrees
                .get(placement.subtree.path())
                .and_then(|cached| lookup(&cached.record, placement));
            if let Some(hash) = hash {
                nodes.push(Node::new(id.clone(), hash));
            }
        }
        Ok(nodes)
    }

    async fn set_node_hash(
        &self,
        id: &NodeId,
        hash: Vec<u8>,
        fetcher: &dyn SubtreeFetcher,
    ) -> StorageResult<()> {
        let placement = self.place(id);
        let cached = self.lock()?.contains_key(placement.subtree.path());
        let loaded = if cached {
            None
        } else {
            fetcher.fetch_subtree(&placement.subtree).await?
        };

        let mut subtrees = self.lock()?;
        let entry = subtrees
            .entry(placement.subtree.path().to_vec())
            .or_insert_with(|| CachedSubtree {
                record: loaded.unwrap_or_else(|| self.empty_subtree(placement.subtree.path())),
                dirty: false,
            });
        let map = if placement.is_leaf {
            &mut entry.record.leaves
        } else {
            &mut entry.record.internal_nodes
        };
        map.insert(placement.suffix, hash);
        entry.dirty = true;
        Ok(())
    }

    fn flush(&self, sink: &mut SubtreeSink<'_>) -> StorageResult<()> {
        let mut subtrees = self.lock()?;
        let mut dirty: Vec<&mut CachedSubtree> =
            subtrees.values_mut().filter(|cached| cached.dirty).collect();
        if dirty.is_empty() {
            return Ok(());
        }
        dirty.sort_by(|a, b| a.record.prefix_bytes().cmp(b.record.prefix_bytes()));

        sink(dirty.iter().map(|cached| cached.record.clone()).collect())?;
        for cached in dirty {
            cached.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed set of subtrees and counts calls.
    #[derive(Default)]
    struct FixedFetcher {
        stored: HashMap<Vec<u8>, SubtreeRecord>,
        batch_calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
        single_calls: AtomicUsize,
    }

    #[async_trait]
    impl SubtreeFetcher for FixedFetcher {
        async fn fetch_subtrees(&self, ids: &[NodeId]) -> StorageResult<Vec<SubtreeRecord>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(ids.len());
            Ok(ids
                .iter()
                .filter_map(|id| self.stored.get(id.path()).cloned())
                .collect())
        }

        async fn fetch_subtree(&self, id: &NodeId) -> StorageResult<Option<SubtreeRecord>> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.stored.get(id.path()).cloned())
        }
    }

    fn leaf(path: &[u8]) -> NodeId {
        NodeId::new(path.to_vec(), path.len() * 8).unwrap()
    }

    #[tokio::test]
    async fn test_get_nodes_fetches_each_subtree_once() {
        let cache = StratumSubtreeCache::new(1).unwrap();
        let mut stored = SubtreeRecord::new(vec![0x01], 8);
        stored.leaves.insert("0802".to_string(), vec![0xaa]);
        let fetcher = FixedFetcher {
            stored: HashMap::from([(vec![0x01], stored)]),
            ..Default::default()
        };

        // Two nodes in subtree 01, one in never-written subtree 05.
        let ids = vec![leaf(&[0x01, 0x02]), leaf(&[0x01, 0x03]), leaf(&[0x05, 0x00])];
        let nodes = cache.get_nodes(&ids, &fetcher).await.unwrap();
        assert_eq!(nodes, vec![Node::new(leaf(&[0x01, 0x02]), vec![0xaa])]);
        assert_eq!(*fetcher.batch_sizes.lock().unwrap(), vec![2]);

        // Everything is cached now, including the empty subtree.
        cache.get_nodes(&ids, &fetcher).await.unwrap();
        assert_eq!(fetcher.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_then_get_and_flush() {
        let cache = StratumSubtreeCache::new(1).unwrap();
        let fetcher = FixedFetcher::default();

        let id = leaf(&[0x10, 0x20]);
        cache.set_node_hash(&id, vec![7], &fetcher).await.unwrap();
        assert_eq!(fetcher.single_calls.load(Ordering::SeqCst), 1);

        let nodes = cache.get_nodes(&[id.clone()], &fetcher).await.unwrap();
        assert_eq!(nodes, vec![Node::new(id, vec![7])]);
        assert_eq!(fetcher.batch_calls.load(Ordering::SeqCst), 0);

        let mut flushed = Vec::new();
        cache
            .flush(&mut |records: Vec<SubtreeRecord>| -> StorageResult<()> {
                flushed.extend(records);
                Ok(())
            })
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].prefix_bytes(), &[0x10]);
        assert_eq!(flushed[0].leaves.get("0820"), Some(&vec![7]));

        // Clean after a successful flush.
        let mut calls = 0;
        cache
            .flush(&mut |_: Vec<SubtreeRecord>| -> StorageResult<()> {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_subtrees_dirty() {
        let cache = StratumSubtreeCache::new(1).unwrap();
        let fetcher = FixedFetcher::default();
        cache.set_node_hash(&leaf(&[0x01]), vec![1], &fetcher).await.unwrap();

        let err = cache
            .flush(&mut |_: Vec<SubtreeRecord>| -> StorageResult<()> {
                Err(StorageError::Backend("boom".to_string()))
            })
            .unwrap_err();
        assert_eq!(err, StorageError::Backend("boom".to_string()));

        let mut count = 0;
        cache
            .flush(&mut |records: Vec<SubtreeRecord>| -> StorageResult<()> {
                count = records.len();
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_placement() {
        let cache = StratumSubtreeCache::new(1).unwrap();

        let root = cache.place(&NodeId::root());
        assert_eq!(root.subtree, NodeId::root());
        assert_eq!(root.suffix, "00");
        assert!(!root.is_leaf);

        let top_leaf = cache.place(&leaf(&[0xab]));
        assert_eq!(top_leaf.subtree, NodeId::root());
        assert_eq!(top_leaf.suffix, "08ab");
        assert!(top_leaf.is_leaf);

        let inner = cache.place(&NodeId::new(vec![0xab, 0xff], 12).unwrap());
        assert_eq!(inner.subtree, NodeId::from_prefix(&[0xab]));
        assert_eq!(inner.suffix, "04f0");
        assert!(!inner.is_leaf);

        let wide = StratumSubtreeCache::new(2).unwrap();
        let deep = wide.place(&leaf(&[0x01, 0x02, 0x03, 0x04]));
        assert_eq!(deep.subtree, NodeId::from_prefix(&[0x01, 0x02]));
        assert_eq!(deep.suffix, "100304");
        assert!(deep.is_leaf);
    }
}
