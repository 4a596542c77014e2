//! Document store trait definition.

use crate::error::StorageResult;
use crate::key::DocumentKey;

/// A durable key-value store of byte documents.
///
/// # Invariants
///
/// - `write` replaces the whole document atomically; readers never observe
///   a partially written document
/// - `read` returns exactly the bytes last written under the key
/// - `list` returns every key at or beneath the prefix, in key order
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait DocumentStore: Send + Sync {
    /// Reads the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read(&self, key: &DocumentKey) -> StorageResult<Option<Vec<u8>>>;

    /// Writes `data` under `key`, replacing any previous document.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write(&self, key: &DocumentKey, data: &[u8]) -> StorageResult<()>;

    /// Removes the document under `key`.
    ///
    /// Returns true if a document was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn remove(&self, key: &DocumentKey) -> StorageResult<bool>;

    /// Lists every key at or beneath `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn list(&self, prefix: &DocumentKey) -> StorageResult<Vec<DocumentKey>>;

    /// Syncs all written documents to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;
}
