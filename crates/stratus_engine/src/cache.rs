//! Durable cache of remote record snapshots.
//!
//! Each snapshot is stored as its own document under
//! `cache/<scope>/<zone>/<type>/<name>`, so reloading or rewriting one
//! record never touches records of unrelated types.

use crate::codec;
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use stratus_protocol::{Record, RecordChange, RecordConvertible, RecordId};
use stratus_storage::{DocumentKey, DocumentStore};
use tracing::{debug, warn};

const CACHE_ROOT: &str = "cache";

/// The cached copy of the last known remote version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    /// The merged record.
    pub record: Record,
    /// When the snapshot was last written.
    pub cached_at: DateTime<Utc>,
}

/// Merge-on-write record cache backed by a [`DocumentStore`].
pub struct LocalCache {
    store: Arc<dyn DocumentStore>,
    snapshots: RwLock<HashMap<RecordId, CachedSnapshot>>,
}

impl LocalCache {
    /// Opens the cache, loading every snapshot found in `store`.
    ///
    /// Snapshots that fail to decode are skipped with a warning.
    pub fn open(store: Arc<dyn DocumentStore>) -> SyncResult<Self> {
        let mut snapshots = HashMap::new();
        for key in store.list(&DocumentKey::new([CACHE_ROOT])?)? {
            let Some(bytes) = store.read(&key)? else {
                continue;
            };
            match codec::decode::<CachedSnapshot>(&bytes) {
                Ok(snapshot) => {
                    snapshots.insert(snapshot.record.id.clone(), snapshot);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable cache entry"),
            }
        }
        debug!(snapshots = snapshots.len(), "loaded record cache");

        Ok(Self {
            store,
            snapshots: RwLock::new(snapshots),
        })
    }

    /// Returns the snapshot of a record.
    pub fn get(&self, id: &RecordId) -> Option<CachedSnapshot> {
        self.snapshots.read().get(id).cloned()
    }

    /// Stores a record, merging it into any existing snapshot.
    ///
    /// Fields present in `record` replace cached values; cached fields
    /// absent from `record` are kept.
    pub fn put(&self, record: Record) -> SyncResult<CachedSnapshot> {
        let mut snapshots = self.snapshots.write();
        let previous = snapshots.get(&record.id).cloned();

        let merged = match &previous {
            Some(existing) => {
                let mut merged = existing.record.clone();
                merged.merge_from(&record);
                merged
            }
            None => record,
        };
        let snapshot = CachedSnapshot {
            record: merged,
            cached_at: Utc::now(),
        };

        if let Some(old) = &previous {
            if old.record.record_type != snapshot.record.record_type {
                self.store.remove(&document_key(&old.record)?)?;
            }
        }
        self.store
            .write(&document_key(&snapshot.record)?, &codec::encode(&snapshot)?)?;
        snapshots.insert(snapshot.record.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    /// Evicts a record from memory and durable storage.
    pub fn remove(&self, id: &RecordId) -> SyncResult<bool> {
        let mut snapshots = self.snapshots.write();
        match snapshots.remove(id) {
            Some(snapshot) => {
                self.store.remove(&document_key(&snapshot.record)?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns every snapshot of a record type, ordered by identifier.
    pub fn all(&self, record_type: &str) -> Vec<CachedSnapshot> {
        let mut matching: Vec<CachedSnapshot> = self
            .snapshots
            .read()
            .values()
            .filter(|s| s.record.record_type == record_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        matching
    }

    /// Decodes every snapshot of `T`'s record type.
    ///
    /// Snapshots that fail to convert are skipped with a warning.
    pub fn all_as<T: RecordConvertible>(&self) -> Vec<T> {
        self.all(T::RECORD_TYPE)
            .iter()
            .filter_map(|snapshot| match T::decode(&snapshot.record) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(record = %snapshot.record.id, error = %e, "skipping unconvertible snapshot");
                    None
                }
            })
            .collect()
    }

    /// Resolves a reference to the snapshot it points at.
    pub fn resolve(&self, reference: &RecordId) -> Option<CachedSnapshot> {
        self.get(reference)
    }

    /// Resolves the reference held in a record field.
    pub fn resolve_field(&self, record: &Record, field: &str) -> Option<CachedSnapshot> {
        record
            .get(field)
            .and_then(|value| value.as_reference())
            .and_then(|id| self.resolve(id))
    }

    /// Applies a remote change.
    pub fn apply(&self, change: &RecordChange) -> SyncResult<()> {
        match change {
            RecordChange::Changed(_, record) => {
                self.put(record.clone())?;
            }
            RecordChange::Deleted(id, _) => {
                self.remove(id)?;
            }
            RecordChange::Malformed => {}
        }
        Ok(())
    }

    /// Returns the number of cached snapshots per record type.
    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for snapshot in self.snapshots.read().values() {
            *counts.entry(snapshot.record.record_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Returns every snapshot, ordered by identifier.
    pub fn snapshots(&self) -> Vec<CachedSnapshot> {
        let mut all: Vec<CachedSnapshot> = self.snapshots.read().values().cloned().collect();
        all.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        all
    }

    /// Returns the number of cached snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Syncs the backing store.
    pub fn sync(&self) -> SyncResult<()> {
        Ok(self.store.sync()?)
    }
}

fn document_key(record: &Record) -> SyncResult<DocumentKey> {
    let id = &record.id;
    Ok(DocumentKey::new([
        CACHE_ROOT,
        id.partition.scope.name(),
        id.partition.zone.as_str(),
        record.record_type.as_str(),
        id.name.as_str(),
    ])?)
}
