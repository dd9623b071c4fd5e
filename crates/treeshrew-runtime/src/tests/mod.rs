//! Test modules for treeshrew-runtime
//!
//! Transaction, subtree fetch and tree head tests run against the scripted
//! backend from `test_utils`.
