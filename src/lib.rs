//! Treeshrew Test Suite
//!
//! End-to-end tests driving `TreeStorage` over both the in-memory MVCC
//! backend and RocksDB.

pub mod tests;

pub use tests::{TestTrees, TEST_TREE_ID};
