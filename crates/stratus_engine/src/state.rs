//! Persisted local sync state.

use crate::codec;
use crate::error::SyncResult;
use crate::remote::Identity;
use crate::tokens::ChangeToken;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use stratus_protocol::{Partition, RecordId};
use stratus_storage::{DocumentKey, DocumentStore, InMemoryStore};
use tracing::{debug, warn};

/// Everything the engine remembers between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    /// Change token per partition.
    #[serde(with = "token_entries")]
    pub change_tokens: BTreeMap<Partition, ChangeToken>,
    /// Zone names provisioned for the last identity.
    pub provisioned_partitions: Option<BTreeSet<String>>,
    /// Identity of the last signed-in user.
    pub last_identity: Option<Identity>,
    /// Records awaiting remote delete confirmation.
    pub pending_deletions: BTreeSet<RecordId>,
}

// Partitions are not string keys, so the map is persisted as entries.
mod token_entries {
    use super::{ChangeToken, Partition};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<Partition, ChangeToken>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Partition, ChangeToken>, D::Error> {
        let entries: Vec<(Partition, ChangeToken)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

/// Write-through holder of [`LocalState`].
///
/// Every mutation is persisted before it becomes visible.
pub struct StateStore {
    store: Arc<dyn DocumentStore>,
    state: RwLock<LocalState>,
}

impl StateStore {
    /// Loads the state document from `store`.
    ///
    /// A state document that fails to decode is discarded with a warning;
    /// the engine then resyncs from scratch.
    pub fn open(store: Arc<dyn DocumentStore>) -> SyncResult<Self> {
        let state = match store.read(&state_key()?)? {
            Some(bytes) => codec::decode(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "discarding undecodable sync state");
                LocalState::default()
            }),
            None => LocalState::default(),
        };
        debug!(
            tokens = state.change_tokens.len(),
            pending_deletions = state.pending_deletions.len(),
            "loaded sync state"
        );
        Ok(Self {
            store,
            state: RwLock::new(state),
        })
    }

    /// Creates a state store backed by memory only.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            state: RwLock::new(LocalState::default()),
        }
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> LocalState {
        self.state.read().clone()
    }

    /// Reads from the current state.
    pub fn read<R>(&self, f: impl FnOnce(&LocalState) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutates the state and persists the result.
    ///
    /// The in-memory state is only replaced once the write succeeded.
    pub fn update<R>(&self, f: impl FnOnce(&mut LocalState) -> R) -> SyncResult<R> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let result = f(&mut next);
        if next != *guard {
            self.store.write(&state_key()?, &codec::encode(&next)?)?;
            *guard = next;
        }
        Ok(result)
    }
}

/// Key of the state document inside the store.
pub const STATE_KEY: [&str; 2] = ["state", "local"];

fn state_key() -> SyncResult<DocumentKey> {
    Ok(DocumentKey::new(STATE_KEY)?)
}

/// Queue of records deleted locally and awaiting remote confirmation.
///
/// Once a deletion is confirmed the identifier leaves the queue for good.
#[derive(Clone)]
pub struct PendingDeletions {
    state: Arc<StateStore>,
}

impl PendingDeletions {
    /// Creates a view over the persisted state.
    pub fn new(state: Arc<StateStore>) -> Self {
        Self { state }
    }

    /// Queues a record for remote deletion.
    pub fn queue(&self, id: RecordId) -> SyncResult<bool> {
        self.state.update(|s| s.pending_deletions.insert(id))
    }

    /// Returns true if the record is queued.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.state.read(|s| s.pending_deletions.contains(id))
    }

    /// Returns queued records grouped by partition.
    pub fn by_partition(&self) -> BTreeMap<Partition, Vec<RecordId>> {
        self.state.read(|s| {
            let mut groups: BTreeMap<Partition, Vec<RecordId>> = BTreeMap::new();
            for id in &s.pending_deletions {
                groups.entry(id.partition.clone()).or_default().push(id.clone());
            }
            groups
        })
    }

    /// Removes confirmed deletions from the queue.
    pub fn confirm(&self, ids: &[RecordId]) -> SyncResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.state.update(|s| {
            ids.iter()
                .filter(|id| s.pending_deletions.remove(*id))
                .count()
        })
    }

    /// Returns the number of queued deletions.
    pub fn len(&self) -> usize {
        self.state.read(|s| s.pending_deletions.len())
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_storage::FileStore;
    use tempfile::tempdir;

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let main = Partition::private("Main");
        {
            let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(dir.path()).unwrap());
            let state = StateStore::open(store).unwrap();
            state
                .update(|s| {
                    s.change_tokens.insert(main.clone(), ChangeToken(vec![7]));
                    s.last_identity = Some(Identity::new("user-1"));
                    s.pending_deletions.insert(main.record_id("gone"));
                })
                .unwrap();
        }

        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let state = StateStore::open(store).unwrap().snapshot();
        assert_eq!(state.change_tokens.get(&main), Some(&ChangeToken(vec![7])));
        assert_eq!(state.last_identity, Some(Identity::new("user-1")));
        assert!(state.pending_deletions.contains(&main.record_id("gone")));
    }

    #[test]
    fn corrupt_state_starts_fresh() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
        store.write(&state_key().unwrap(), b"not cbor at all").unwrap();

        let state = StateStore::open(store).unwrap();
        assert_eq!(state.snapshot(), LocalState::default());
    }

    #[test]
    fn pending_deletions_drain_monotonically() {
        let deletions = PendingDeletions::new(Arc::new(StateStore::in_memory()));
        let main = Partition::private("Main");
        let a = main.record_id("a");
        let b = main.record_id("b");

        assert!(deletions.queue(a.clone()).unwrap());
        assert!(!deletions.queue(a.clone()).unwrap());
        deletions.queue(b.clone()).unwrap();

        assert_eq!(deletions.confirm(&[a.clone()]).unwrap(), 1);
        assert!(!deletions.contains(&a));
        assert!(deletions.contains(&b));
        assert_eq!(deletions.confirm(&[a.clone()]).unwrap(), 0);
        assert_eq!(deletions.by_partition().get(&main), Some(&vec![b]));
    }
}
