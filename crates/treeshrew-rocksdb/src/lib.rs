//! RocksDB backend for treeshrew

pub mod adapter;
pub mod optimized_config;

pub use adapter::{RocksReadScope, RocksTreeDb, RocksWriteScope};
pub use optimized_config::{create_optimized_options, log_performance_stats};

/// Tree storage running on RocksDB.
pub type RocksTreeStorage = treeshrew_runtime::TreeStorage<RocksTreeDb>;
