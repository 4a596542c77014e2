//! Remote record store abstraction.

use crate::error::{SyncError, SyncResult};
use crate::tokens::ChangeToken;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;
use stratus_protocol::{Partition, Record, RecordChange, RecordId, Scope};

/// Account availability reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Signed in and usable.
    Available,
    /// No account on this device.
    NoAccount,
    /// Access blocked by policy.
    Restricted,
    /// Status could not be read.
    CouldNotDetermine,
    /// The account service is briefly unavailable.
    TemporarilyUnavailable,
}

/// Stable identifier of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    /// Creates an identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of changes for a partition.
#[derive(Debug, Default)]
pub struct FetchPage {
    /// Changes in server order.
    pub changes: Vec<RecordChange>,
    /// Records the server could not deliver.
    pub failures: Vec<(RecordId, SyncError)>,
    /// Token marking the end of this page.
    pub token: ChangeToken,
    /// True if another page follows.
    pub more_coming: bool,
}

/// One page of a record query.
#[derive(Debug, Default)]
pub struct QueryPage {
    /// Matching records.
    pub records: Vec<Record>,
    /// Cursor for the next page, if any.
    pub cursor: Option<Vec<u8>>,
}

/// Per-record outcome of a modify call.
#[derive(Debug, Default)]
pub struct ModifyOutcome {
    /// Saved records as stored by the server.
    pub saved: Vec<Record>,
    /// Deleted record identifiers.
    pub deleted: Vec<RecordId>,
    /// Records that could not be saved or deleted.
    ///
    /// A [`SyncError::Conflict`] carries the server's current version.
    pub failures: Vec<(RecordId, SyncError)>,
}

/// The remote record store.
///
/// Implementations own the wire protocol; the engine only sees records,
/// change pages and per-record failures.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Reads the account status.
    async fn account_status(&self) -> SyncResult<AccountStatus>;

    /// Reads the identity of the signed-in user.
    async fn current_identity(&self) -> SyncResult<Identity>;

    /// Probes whether the service is reachable.
    async fn check_connectivity(&self) -> bool;

    /// Creates private zones; existing zones are left untouched.
    async fn provision_partitions(&self, names: &[String]) -> SyncResult<()>;

    /// Fetches the changes after `token`, or from the start without one.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChangeTokenExpired`] if the server no longer
    /// accepts the token.
    async fn fetch_changes(
        &self,
        partition: &Partition,
        token: Option<&ChangeToken>,
    ) -> SyncResult<FetchPage>;

    /// Queries every record of a type.
    async fn query_records(
        &self,
        partition: &Partition,
        record_type: &str,
        cursor: Option<&[u8]>,
    ) -> SyncResult<QueryPage>;

    /// Saves and deletes records in one call.
    async fn modify_records(
        &self,
        partition: &Partition,
        save: Vec<Record>,
        delete: Vec<RecordId>,
    ) -> SyncResult<ModifyOutcome>;
}

#[derive(Default)]
struct Zone {
    records: BTreeMap<String, Record>,
    log: Vec<RecordChange>,
}

struct RemoteInner {
    account: AccountStatus,
    identity: Identity,
    reachable: bool,
    zones: BTreeMap<Partition, Zone>,
    next_tag: u64,
    fetch_errors: VecDeque<SyncError>,
    modify_errors: VecDeque<SyncError>,
    fetch_failures: BTreeMap<Partition, Vec<(RecordId, SyncError)>>,
    fetch_calls: usize,
    modify_batches: Vec<usize>,
    provision_calls: usize,
}

/// An in-memory remote store for testing.
///
/// Each partition keeps a change log; a change token is the log position
/// encoded as little-endian bytes. Writes carrying a stale or missing change
/// tag for an existing record fail with [`SyncError::Conflict`].
pub struct MemoryRemoteStore {
    inner: Mutex<RemoteInner>,
    page_size: usize,
    fetch_delay: Mutex<Option<Duration>>,
}

impl MemoryRemoteStore {
    /// Creates a store with an available account.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RemoteInner {
                account: AccountStatus::Available,
                identity: Identity::new("user-1"),
                reachable: true,
                zones: BTreeMap::new(),
                next_tag: 1,
                fetch_errors: VecDeque::new(),
                modify_errors: VecDeque::new(),
                fetch_failures: BTreeMap::new(),
                fetch_calls: 0,
                modify_batches: Vec::new(),
                provision_calls: 0,
            }),
            page_size: 100,
            fetch_delay: Mutex::new(None),
        }
    }

    /// Sets how many changes a fetch page holds.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the account status.
    pub fn set_account_status(&self, status: AccountStatus) {
        self.inner.lock().account = status;
    }

    /// Sets the signed-in identity.
    pub fn set_identity(&self, identity: Identity) {
        self.inner.lock().identity = identity;
    }

    /// Makes the store reachable or unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Delays every fetch call.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock() = delay;
    }

    /// Fails the next fetch call with `error`.
    pub fn fail_next_fetch(&self, error: SyncError) {
        self.inner.lock().fetch_errors.push_back(error);
    }

    /// Fails the next modify call with `error`.
    pub fn fail_next_modify(&self, error: SyncError) {
        self.inner.lock().modify_errors.push_back(error);
    }

    /// Reports a per-record failure in the next fetch page of a partition.
    pub fn fail_record_in_next_fetch(&self, id: RecordId, error: SyncError) {
        self.inner
            .lock()
            .fetch_failures
            .entry(id.partition.clone())
            .or_default()
            .push((id, error));
    }

    /// Creates a partition.
    pub fn add_partition(&self, partition: Partition) {
        self.inner.lock().zones.entry(partition).or_default();
    }

    /// Returns true if the partition exists.
    pub fn has_partition(&self, partition: &Partition) -> bool {
        self.inner.lock().zones.contains_key(partition)
    }

    /// Writes a record as another device would.
    ///
    /// The record receives a fresh change tag; its modification time is
    /// kept if set and stamped otherwise.
    pub fn put_server_record(&self, record: Record) -> Record {
        self.inner.lock().store(record, false)
    }

    /// Deletes a record as another device would.
    pub fn delete_server_record(&self, id: &RecordId) -> bool {
        self.inner.lock().delete(id)
    }

    /// Returns the server's copy of a record.
    pub fn server_record(&self, id: &RecordId) -> Option<Record> {
        self.inner
            .lock()
            .zones
            .get(&id.partition)
            .and_then(|zone| zone.records.get(&id.name))
            .cloned()
    }

    /// Returns every record in a partition.
    pub fn records(&self, partition: &Partition) -> Vec<Record> {
        self.inner
            .lock()
            .zones
            .get(partition)
            .map(|zone| zone.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of fetch calls made.
    pub fn fetch_calls(&self) -> usize {
        self.inner.lock().fetch_calls
    }

    /// Returns the number of records sent by each modify call.
    pub fn modify_batches(&self) -> Vec<usize> {
        self.inner.lock().modify_batches.clone()
    }

    /// Returns the number of provisioning calls made.
    pub fn provision_calls(&self) -> usize {
        self.inner.lock().provision_calls
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteInner {
    fn check_reachable(&self) -> SyncResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(SyncError::NetworkUnavailable("remote unreachable".into()))
        }
    }

    fn zone(&mut self, partition: &Partition) -> SyncResult<&mut Zone> {
        self.zones
            .get_mut(partition)
            .ok_or_else(|| SyncError::PartitionNotFound(partition.clone()))
    }

    fn store(&mut self, mut record: Record, stamp_now: bool) -> Record {
        record.change_tag = Some(format!("tag-{}", self.next_tag));
        self.next_tag += 1;
        if stamp_now || record.modified_at.is_none() {
            record.modified_at = Some(Utc::now());
        }
        let zone = self.zones.entry(record.partition().clone()).or_default();
        zone.records.insert(record.id.name.clone(), record.clone());
        zone.log.push(RecordChange::changed(record.clone()));
        record
    }

    fn delete(&mut self, id: &RecordId) -> bool {
        let Some(zone) = self.zones.get_mut(&id.partition) else {
            return false;
        };
        match zone.records.remove(&id.name) {
            Some(record) => {
                zone.log
                    .push(RecordChange::deleted(id.clone(), record.record_type));
                true
            }
            None => false,
        }
    }
}

fn encode_position(position: usize) -> ChangeToken {
    ChangeToken((position as u64).to_le_bytes().to_vec())
}

fn decode_position(token: &ChangeToken) -> SyncResult<usize> {
    let bytes: [u8; 8] = token
        .as_bytes()
        .try_into()
        .map_err(|_| SyncError::Malformed(format!("bad change token {token}")))?;
    usize::try_from(u64::from_le_bytes(bytes))
        .map_err(|_| SyncError::Malformed(format!("bad change token {token}")))
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn account_status(&self) -> SyncResult<AccountStatus> {
        Ok(self.inner.lock().account)
    }

    async fn current_identity(&self) -> SyncResult<Identity> {
        Ok(self.inner.lock().identity.clone())
    }

    async fn check_connectivity(&self) -> bool {
        self.inner.lock().reachable
    }

    async fn provision_partitions(&self, names: &[String]) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.check_reachable()?;
        inner.provision_calls += 1;
        for name in names {
            inner
                .zones
                .entry(Partition::new(Scope::Private, name.clone()))
                .or_default();
        }
        Ok(())
    }

    async fn fetch_changes(
        &self,
        partition: &Partition,
        token: Option<&ChangeToken>,
    ) -> SyncResult<FetchPage> {
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        inner.fetch_calls += 1;
        inner.check_reachable()?;
        if let Some(error) = inner.fetch_errors.pop_front() {
            return Err(error);
        }
        let failures = inner.fetch_failures.remove(partition).unwrap_or_default();

        let start = token.map(decode_position).transpose()?.unwrap_or(0);
        let zone = inner.zone(partition)?;
        if start > zone.log.len() {
            return Err(SyncError::ChangeTokenExpired(partition.clone()));
        }
        let end = (start + self.page_size).min(zone.log.len());

        Ok(FetchPage {
            changes: zone.log[start..end].to_vec(),
            failures,
            token: encode_position(end),
            more_coming: end < zone.log.len(),
        })
    }

    async fn query_records(
        &self,
        partition: &Partition,
        record_type: &str,
        cursor: Option<&[u8]>,
    ) -> SyncResult<QueryPage> {
        let mut inner = self.inner.lock();
        inner.check_reachable()?;
        let start = match cursor {
            Some(bytes) => decode_position(&ChangeToken(bytes.to_vec()))?,
            None => 0,
        };
        let matching: Vec<Record> = inner
            .zone(partition)?
            .records
            .values()
            .filter(|record| record.record_type == record_type)
            .cloned()
            .collect();
        let end = (start + self.page_size).min(matching.len());

        Ok(QueryPage {
            records: matching.get(start..end).map(<[Record]>::to_vec).unwrap_or_default(),
            cursor: (end < matching.len()).then(|| encode_position(end).0),
        })
    }

    async fn modify_records(
        &self,
        partition: &Partition,
        save: Vec<Record>,
        delete: Vec<RecordId>,
    ) -> SyncResult<ModifyOutcome> {
        let mut inner = self.inner.lock();
        inner.check_reachable()?;
        if let Some(error) = inner.modify_errors.pop_front() {
            return Err(error);
        }
        inner.zone(partition)?;
        inner.modify_batches.push(save.len() + delete.len());

        let mut outcome = ModifyOutcome::default();
        for record in save {
            let current = inner.zone(partition)?.records.get(&record.id.name).cloned();
            match current {
                Some(server) if server.change_tag != record.change_tag => {
                    outcome.failures.push((
                        record.id.clone(),
                        SyncError::Conflict {
                            id: record.id,
                            server: Box::new(server),
                        },
                    ));
                }
                _ => outcome.saved.push(inner.store(record, true)),
            }
        }
        for id in delete {
            if inner.delete(&id) {
                outcome.deleted.push(id);
            } else {
                outcome.failures.push((id.clone(), SyncError::UnknownItem(id)));
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_zone() -> Partition {
        Partition::private("Main")
    }

    fn note(name: &str, title: &str) -> Record {
        Record::new(main_zone().record_id(name), "Note").with_field("title", title)
    }

    #[tokio::test]
    async fn paged_fetch_with_tokens() {
        let remote = MemoryRemoteStore::new().with_page_size(2);
        for i in 0..3 {
            remote.put_server_record(note(&format!("n{i}"), "t"));
        }

        let first = remote.fetch_changes(&main_zone(), None).await.unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.more_coming);

        let second = remote
            .fetch_changes(&main_zone(), Some(&first.token))
            .await
            .unwrap();
        assert_eq!(second.changes.len(), 1);
        assert!(!second.more_coming);

        let empty = remote
            .fetch_changes(&main_zone(), Some(&second.token))
            .await
            .unwrap();
        assert!(empty.changes.is_empty());
        assert_eq!(remote.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn stale_change_tag_conflicts() {
        let remote = MemoryRemoteStore::new();
        let stored = remote.put_server_record(note("n1", "server"));

        let mut stale = note("n1", "local");
        stale.change_tag = Some("tag-0".into());
        let outcome = remote
            .modify_records(&main_zone(), vec![stale], vec![])
            .await
            .unwrap();
        assert!(outcome.saved.is_empty());
        match &outcome.failures[0].1 {
            SyncError::Conflict { server, .. } => assert_eq!(**server, stored),
            other => panic!("unexpected {other:?}"),
        }

        let mut fresh = note("n1", "local");
        fresh.change_tag = stored.change_tag.clone();
        let outcome = remote
            .modify_records(&main_zone(), vec![fresh], vec![])
            .await
            .unwrap();
        assert_eq!(outcome.saved.len(), 1);
        assert_ne!(outcome.saved[0].change_tag, stored.change_tag);
    }

    #[tokio::test]
    async fn deleting_absent_record_is_unknown_item() {
        let remote = MemoryRemoteStore::new();
        remote.add_partition(main_zone());

        let outcome = remote
            .modify_records(&main_zone(), vec![], vec![main_zone().record_id("ghost")])
            .await
            .unwrap();
        assert!(matches!(outcome.failures[0].1, SyncError::UnknownItem(_)));
    }

    #[tokio::test]
    async fn unknown_partition_and_unreachable() {
        let remote = MemoryRemoteStore::new();
        assert!(matches!(
            remote.fetch_changes(&main_zone(), None).await,
            Err(SyncError::PartitionNotFound(_))
        ));

        remote
            .provision_partitions(&["Main".to_string()])
            .await
            .unwrap();
        assert!(remote.has_partition(&main_zone()));

        remote.set_reachable(false);
        assert!(!remote.check_connectivity().await);
        assert!(remote
            .fetch_changes(&main_zone(), None)
            .await
            .unwrap_err()
            .is_connectivity());
    }

    #[tokio::test]
    async fn query_pages_by_type() {
        let remote = MemoryRemoteStore::new().with_page_size(2);
        for i in 0..3 {
            remote.put_server_record(note(&format!("n{i}"), "t"));
        }
        remote.put_server_record(Record::new(main_zone().record_id("tag"), "Tag"));

        let first = remote.query_records(&main_zone(), "Note", None).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let cursor = first.cursor.unwrap();
        let second = remote
            .query_records(&main_zone(), "Note", Some(&cursor))
            .await
            .unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.cursor.is_none());
    }
}
