//! In-memory document store for testing.

use crate::error::StorageResult;
use crate::key::DocumentKey;
use crate::store::DocumentStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory document store.
///
/// This store keeps all documents in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sync state that doesn't need persistence
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use stratus_storage::{DocumentKey, DocumentStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// let key = DocumentKey::new(["state", "local"]).unwrap();
/// store.write(&key, b"data").unwrap();
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    documents: RwLock<BTreeMap<DocumentKey, Vec<u8>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Returns true if no documents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Removes all documents.
    pub fn clear(&self) {
        self.documents.write().clear();
    }
}

impl DocumentStore for InMemoryStore {
    fn read(&self, key: &DocumentKey) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.documents.read().get(key).cloned())
    }

    fn write(&self, key: &DocumentKey, data: &[u8]) -> StorageResult<()> {
        self.documents.write().insert(key.clone(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &DocumentKey) -> StorageResult<bool> {
        Ok(self.documents.write().remove(key).is_some())
    }

    fn list(&self, prefix: &DocumentKey) -> StorageResult<Vec<DocumentKey>> {
        Ok(self
            .documents
            .read()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
