//! Error types for treeshrew storage

use thiserror::Error;

/// Every failure the storage layer reports.
///
/// Errors are `Clone` because a failed tree head resolution is memoized
/// and handed to every later caller of the same transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("tree {0} needs initialising: no tree head found")]
    TreeNeedsInit(i64),

    #[error("transaction is closed")]
    TransactionClosed,

    #[error("mutating method called on read-only transaction")]
    WrongTransactionType,

    #[error("prefix_len_bits ({prefix_len_bits}) is not a multiple of 8; it cannot be a subtree prefix")]
    UnalignedPrefix { prefix_len_bits: usize },

    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("row already exists: {0}")]
    AlreadyExists(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
