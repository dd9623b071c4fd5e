//! In-memory MVCC backend for treeshrew, for tests and embedding

pub mod adapter;

pub use adapter::{MemReadScope, MemTreeDb, MemWriteScope};

/// Tree storage running on the in-memory backend.
pub type MemTreeStorage = treeshrew_runtime::TreeStorage<MemTreeDb>;
