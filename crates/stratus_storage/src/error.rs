//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A key segment cannot be used.
    #[error("invalid document key: {0}")]
    InvalidKey(String),

    /// Another process holds the store lock.
    #[error("store at {0} is locked by another process")]
    Locked(String),

    /// The store directory is unusable.
    #[error("store corrupted: {0}")]
    Corrupted(String),
}
