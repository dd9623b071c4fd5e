//! Storage configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Levers for a [`crate::TreeStorage`] instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStorageOptions {
    /// How far in the past read-only transactions read. Lets a replicated
    /// backend serve them from a local replica.
    pub read_only_staleness: Duration,
}

impl TreeStorageOptions {
    pub fn with_read_only_staleness(mut self, staleness: Duration) -> Self {
        self.read_only_staleness = staleness;
        self
    }
}

/// Shape of the subtrees built by [`crate::StratumCacheFactory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Depth of each subtree stratum, in bytes.
    pub stratum_bytes: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { stratum_bytes: 1 }
    }
}
