//! Download and upload reconciliation.
//!
//! The [`Synchronizer`] applies remote changes to the local store and sends
//! local changes back:
//!
//! - **Download**: pulls a [`RemoteChangeSequence`] (or pages a type query),
//!   resolves each change against the local entity, links references, and
//!   finishes with a flush and a reconciliation pass
//! - **Upload**: collects dirty entities grouped by partition, drains the
//!   pending deletion queue, and writes batches per partition, resolving
//!   write conflicts with a bounded number of resubmissions
//!
//! At most one upload pass runs at a time; requests that arrive during a
//! pass are coalesced into one follow-up pass.

use crate::cache::LocalCache;
use crate::connector::{ConnectReport, PendingEdge, ReferenceConnector};
use crate::context::SyncContext;
use crate::error::{ErrorDisposition, SyncError, SyncResult};
use crate::local::{EntityInfo, EntityTxn, LocalEntity, LocalId, LocalStore};
use crate::remote::{ModifyOutcome, RemoteStore};
use crate::sequence::RemoteChangeSequence;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stratus_protocol::{
    Partition, QueryMode, Record, RecordChange, RecordId, Resolution, WriteResolution,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to one downloaded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new local entity was created.
    Created,
    /// The local entity was overwritten from remote.
    Updated,
    /// The local version won and stays dirty.
    KeptLocal,
    /// A merged version was applied.
    Merged,
    /// The local entity was deleted.
    Deleted,
    /// Nothing changed locally.
    Ignored,
}

/// Summary of a download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadReport {
    /// Entities created.
    pub created: usize,
    /// Entities overwritten from remote.
    pub updated: usize,
    /// Conflicts won by the local version.
    pub kept_local: usize,
    /// Conflicts resolved by merging.
    pub merged: usize,
    /// Entities deleted.
    pub deleted: usize,
    /// Changes with no local effect.
    pub ignored: usize,
    /// References still unresolved after the reconciliation pass.
    pub orphaned: Vec<PendingEdge>,
}

impl DownloadReport {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::KeptLocal => self.kept_local += 1,
            ApplyOutcome::Merged => self.merged += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Ignored => self.ignored += 1,
        }
    }

    /// Returns the number of changes that touched the local store.
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.kept_local + self.merged + self.deleted
    }
}

/// Summary of an upload.
#[derive(Debug, Default)]
pub struct UploadReport {
    /// Records saved.
    pub saved: usize,
    /// Records deleted remotely.
    pub deleted: usize,
    /// Write conflicts resolved.
    pub conflicts_resolved: usize,
    /// Per-record failures; the affected entities stay dirty or queued.
    pub failures: Vec<(RecordId, SyncError)>,
    /// True if the session was offline and nothing was sent.
    pub skipped: bool,
    /// True if the request was folded into a pass already running.
    pub coalesced: bool,
    /// Passes executed for this request.
    pub passes: usize,
}

impl UploadReport {
    fn absorb(&mut self, other: UploadReport) {
        self.saved += other.saved;
        self.deleted += other.deleted;
        self.conflicts_resolved += other.conflicts_resolved;
        self.failures.extend(other.failures);
        self.skipped |= other.skipped;
        self.passes += other.passes;
    }
}

struct PendingSave {
    local_id: LocalId,
    info: EntityInfo,
    record: Record,
    sent: LocalEntity,
}

/// Upload pass ownership. Both flags change under one lock so a request
/// is either seen by the running pass or starts a new one.
#[derive(Debug, Default)]
struct UploadGate {
    running: bool,
    requested: bool,
}

/// Releases the gate if a pass ends early, by error or by being dropped.
struct GateRelease<'a> {
    gate: &'a Mutex<UploadGate>,
    armed: bool,
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.lock().running = false;
        }
    }
}

#[derive(Default)]
struct PartitionBatch {
    deletions: Vec<RecordId>,
    saves: Vec<PendingSave>,
}

/// Reconciles a local store with a remote store.
pub struct Synchronizer<R: RemoteStore, L: LocalStore> {
    ctx: Arc<SyncContext>,
    remote: Arc<R>,
    local: Arc<L>,
    cache: Option<Arc<LocalCache>>,
    connector: Mutex<ReferenceConnector>,
    upload_gate: Mutex<UploadGate>,
    debounce_generation: AtomicU64,
    upload_passes: AtomicU64,
    cancel: Mutex<CancellationToken>,
}

impl<R: RemoteStore, L: LocalStore> Synchronizer<R, L> {
    /// Creates a synchronizer.
    pub fn new(ctx: Arc<SyncContext>, remote: Arc<R>, local: Arc<L>) -> Self {
        Self {
            ctx,
            remote,
            local,
            cache: None,
            connector: Mutex::new(ReferenceConnector::new()),
            upload_gate: Mutex::new(UploadGate::default()),
            debounce_generation: AtomicU64::new(0),
            upload_passes: AtomicU64::new(0),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Keeps `cache` current with every downloaded and uploaded record.
    pub fn with_cache(mut self, cache: Arc<LocalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Returns the shared context.
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Returns the attached cache.
    pub fn cache(&self) -> Option<&Arc<LocalCache>> {
        self.cache.as_ref()
    }

    /// Returns the number of upload passes executed so far.
    pub fn upload_passes(&self) -> u64 {
        self.upload_passes.load(Ordering::SeqCst)
    }

    /// Returns the number of references waiting for their target.
    pub fn pending_references(&self) -> usize {
        self.connector.lock().pending()
    }

    /// Cancels the running download or upload.
    ///
    /// Later calls start with a fresh cancellation token.
    pub fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
    }

    /// Downloads changes for `partitions` and applies them.
    ///
    /// A fatal error cancels the sequence; changes already applied stay
    /// applied and the import is still finished before the error is
    /// returned.
    pub async fn download_changes(
        &self,
        partitions: &[Partition],
        mode: QueryMode,
    ) -> SyncResult<DownloadReport> {
        let cancel = self.cancel.lock().child_token();
        let mut sequence = RemoteChangeSequence::start(
            Arc::clone(&self.remote),
            partitions,
            mode,
            self.ctx.tokens(),
            Arc::clone(&self.ctx.error_hook),
            &self.ctx.config,
            cancel,
        )?;

        let mut report = DownloadReport::default();
        let pulled = loop {
            let change = match sequence.next().await {
                Some(Ok(change)) => change,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            let Some(from) = change.id().map(|id| id.partition.clone()) else {
                warn!("ignoring malformed change");
                report.record(ApplyOutcome::Ignored);
                continue;
            };
            match self.process_or_skip(&change, &from) {
                Ok(outcome) => report.record(outcome),
                Err(e) => break Err(e),
            }
        };
        drop(sequence);

        let finished = self.finish_importing();
        pulled?;
        report.orphaned = finished?.orphaned;
        info!(
            applied = report.applied(),
            ignored = report.ignored,
            orphaned = report.orphaned.len(),
            "download complete"
        );
        Ok(report)
    }

    /// Downloads every record of a type in `partition`, keeping those that
    /// match `predicate`.
    pub async fn download_all(
        &self,
        record_type: &str,
        predicate: Option<&(dyn Fn(&Record) -> bool + Send + Sync)>,
        partition: &Partition,
    ) -> SyncResult<DownloadReport> {
        let mut report = DownloadReport::default();
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let page = self
                .bounded(self.remote.query_records(partition, record_type, cursor.as_deref()))
                .await?;
            for record in page.records {
                if !predicate.map_or(true, |matches| matches(&record)) {
                    continue;
                }
                let outcome = self.process_or_skip(&RecordChange::changed(record), partition)?;
                report.record(outcome);
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        report.orphaned = self.finish_importing()?.orphaned;
        debug!(record_type, partition = %partition, applied = report.applied(), "query download complete");
        Ok(report)
    }

    /// Applies one remote change to the local store.
    ///
    /// Applying the same change twice leaves the same state as applying it
    /// once. Deleting a record with no local entity is not an error; a
    /// change to an unregistered record type fails with
    /// [`SyncError::UnknownRecordType`], which downloads pass through the
    /// error hook.
    pub fn process(&self, change: &RecordChange, from: &Partition) -> SyncResult<ApplyOutcome> {
        if let Some(id) = change.id() {
            if &id.partition != from {
                warn!(record = %id, partition = %from, "change does not belong to partition");
                return Ok(ApplyOutcome::Ignored);
            }
        }

        match change {
            RecordChange::Changed(id, record) => self.apply_changed(id, record),
            RecordChange::Deleted(id, record_type) => self.apply_deleted(id, record_type),
            RecordChange::Malformed => {
                warn!(partition = %from, "ignoring malformed change");
                Ok(ApplyOutcome::Ignored)
            }
        }
    }

    /// Links queued references, flushes the local store and syncs the
    /// cache.
    pub fn finish_importing(&self) -> SyncResult<ConnectReport> {
        let report = {
            let mut connector = self.connector.lock();
            self.local
                .transaction(|txn| connector.connect_unresolved(txn))?
        };
        self.local.flush()?;
        if let Some(cache) = &self.cache {
            cache.sync()?;
        }
        debug!(
            resolved = report.resolved,
            dropped = report.dropped,
            orphaned = report.orphaned.len(),
            "import finished"
        );
        Ok(report)
    }

    /// Uploads local changes.
    ///
    /// Does nothing while offline. If a pass is already running the
    /// request is coalesced: the running pass runs once more when it ends.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotSignedIn`] when signed out, and any fatal
    /// error raised by the remote store. Per-record failures, including
    /// exhausted conflict retries, are reported in
    /// [`UploadReport::failures`].
    pub async fn upload_local_changes(&self) -> SyncResult<UploadReport> {
        if !self.enter_upload() {
            debug!("upload already running; request coalesced");
            return Ok(UploadReport {
                coalesced: true,
                ..UploadReport::default()
            });
        }
        let mut release = GateRelease {
            gate: &self.upload_gate,
            armed: true,
        };

        let mut report = UploadReport::default();
        loop {
            report.absorb(self.upload_pass().await?);
            if !self.continue_upload() {
                break;
            }
            debug!("running coalesced upload request");
        }
        release.armed = false;
        Ok(report)
    }

    /// Claims the upload pass, or records a request for the running one.
    fn enter_upload(&self) -> bool {
        let mut gate = self.upload_gate.lock();
        if gate.running {
            gate.requested = true;
            false
        } else {
            gate.running = true;
            gate.requested = false;
            true
        }
    }

    /// Consumes a pending request, or releases the pass if there is none.
    fn continue_upload(&self) -> bool {
        let mut gate = self.upload_gate.lock();
        if gate.requested {
            gate.requested = false;
            true
        } else {
            gate.running = false;
            false
        }
    }

    /// Requests an upload after the debounce interval.
    ///
    /// Requests made within one interval collapse into a single upload.
    pub fn schedule_upload(self: &Arc<Self>) -> JoinHandle<()> {
        let generation = self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.ctx.config.upload_debounce).await;
            if this.debounce_generation.load(Ordering::SeqCst) != generation {
                debug!("scheduled upload superseded");
                return;
            }
            if let Err(e) = this.upload_local_changes().await {
                warn!(error = %e, "scheduled upload failed");
            }
        })
    }

    /// Queues a remote delete.
    ///
    /// Returns false if it was already queued.
    pub fn queue_deletion(&self, id: RecordId) -> SyncResult<bool> {
        self.ctx.pending_deletions().queue(id)
    }

    /// Deletes an entity locally and queues its remote delete.
    ///
    /// An entity never linked to a remote record is removed at once; a
    /// linked one is flagged and removed when the remote delete is
    /// confirmed. Returns false if the entity does not exist.
    pub fn delete_entity(&self, local_id: LocalId) -> SyncResult<bool> {
        let found = self.local.transaction(|txn| {
            let Some(mut entity) = txn.get(local_id) else {
                return Ok(None);
            };
            match entity.remote_id.clone() {
                Some(id) => {
                    entity.pending_deletion = true;
                    txn.update(entity)?;
                    Ok(Some(Some(id)))
                }
                None => {
                    txn.delete(local_id);
                    Ok(Some(None))
                }
            }
        })?;

        match found {
            None => Ok(false),
            Some(Some(id)) => {
                self.queue_deletion(id)?;
                Ok(true)
            }
            Some(None) => {
                self.connector.lock().forget_source(local_id);
                Ok(true)
            }
        }
    }

    fn process_or_skip(&self, change: &RecordChange, from: &Partition) -> SyncResult<ApplyOutcome> {
        match self.process(change, from) {
            Ok(outcome) => Ok(outcome),
            Err(e) if (self.ctx.error_hook)(&e) == ErrorDisposition::RecordLocal => {
                warn!(record = ?change.id(), error = %e, "skipping change");
                Ok(ApplyOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    fn apply_changed(&self, id: &RecordId, record: &Record) -> SyncResult<ApplyOutcome> {
        if let Some(cache) = &self.cache {
            cache.put(record.clone())?;
        }
        let Some(info) = self.ctx.registry.by_record_type(&record.record_type) else {
            return Err(SyncError::UnknownRecordType(record.record_type.clone()));
        };

        let mut connector = self.connector.lock();
        self.local.transaction(|txn| {
            let Some(mut entity) = txn.find_by_remote_id(id) else {
                let mut entity = LocalEntity::new(info.entity_type.clone());
                info.load(&mut entity, record);
                let local_id = txn.insert(entity);
                connect_references(&mut connector, txn, local_id, info, record)?;
                return Ok(ApplyOutcome::Created);
            };
            if entity.pending_deletion {
                debug!(record = %id, "ignoring change to entity pending deletion");
                return Ok(ApplyOutcome::Ignored);
            }

            let references = remote_references(txn, &entity);
            let local = info.to_record(&entity, id.clone(), &references);
            let resolution = self.ctx.resolver.resolve_edited(
                &local,
                entity.unsent_change_time(),
                &entity.dirty,
                record,
            );

            match resolution {
                Resolution::AcceptRemote => {
                    info.load(&mut entity, record);
                    let local_id = entity.local_id;
                    txn.update(entity)?;
                    connect_references(&mut connector, txn, local_id, info, record)?;
                    Ok(ApplyOutcome::Updated)
                }
                Resolution::KeepLocal => {
                    debug!(record = %id, "local version kept");
                    entity.change_tag = record.change_tag.clone();
                    txn.update(entity)?;
                    Ok(ApplyOutcome::KeptLocal)
                }
                Resolution::Merge(merged) => {
                    for (name, value) in &merged.fields {
                        if !info.syncs(name) {
                            continue;
                        }
                        if value.as_reference().is_none() {
                            entity.fields.insert(name.clone(), value.clone());
                        }
                        if record.get(name) == Some(value) {
                            entity.dirty.remove(name);
                        } else {
                            entity.dirty.insert(name.clone());
                        }
                    }
                    entity.change_tag = record.change_tag.clone();
                    let local_id = entity.local_id;
                    txn.update(entity)?;
                    connect_references(&mut connector, txn, local_id, info, &merged)?;
                    Ok(ApplyOutcome::Merged)
                }
            }
        })
    }

    fn apply_deleted(&self, id: &RecordId, record_type: &str) -> SyncResult<ApplyOutcome> {
        if let Some(cache) = &self.cache {
            cache.remove(id)?;
        }
        self.ctx
            .pending_deletions()
            .confirm(std::slice::from_ref(id))?;

        let mut connector = self.connector.lock();
        let removed = self.local.transaction(|txn| {
            Ok(match txn.find_by_remote_id(id) {
                Some(entity) => {
                    txn.delete(entity.local_id);
                    connector.forget_source(entity.local_id);
                    true
                }
                None => false,
            })
        })?;

        if removed {
            debug!(record = %id, record_type, "deleted local entity");
            Ok(ApplyOutcome::Deleted)
        } else {
            Ok(ApplyOutcome::Ignored)
        }
    }

    async fn upload_pass(&self) -> SyncResult<UploadReport> {
        let auth = self.ctx.auth.current();
        if auth.is_offline() {
            info!("offline; upload skipped");
            return Ok(UploadReport {
                skipped: true,
                ..UploadReport::default()
            });
        }
        if !auth.is_signed_in() {
            return Err(SyncError::NotSignedIn);
        }
        self.upload_passes.fetch_add(1, Ordering::SeqCst);

        let batches = self.collect_changes()?;
        let cancel = self.cancel.lock().clone();
        let results = join_all(
            batches
                .into_iter()
                .map(|(partition, batch)| self.upload_partition(partition, batch, &cancel)),
        )
        .await;

        let mut report = UploadReport {
            passes: 1,
            ..UploadReport::default()
        };
        let mut first_error = None;
        for result in results {
            match result {
                Ok(partial) => report.absorb(partial),
                Err(e) => {
                    warn!(error = %e, "partition upload failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        // Partitions that finished have confirmed writes to persist.
        self.local.flush()?;
        if let Some(cache) = &self.cache {
            cache.sync()?;
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(
            saved = report.saved,
            deleted = report.deleted,
            conflicts = report.conflicts_resolved,
            failures = report.failures.len(),
            "upload pass complete"
        );
        Ok(report)
    }

    fn collect_changes(&self) -> SyncResult<BTreeMap<Partition, PartitionBatch>> {
        let pending = self.ctx.pending_deletions();
        let mut batches: BTreeMap<Partition, PartitionBatch> = BTreeMap::new();
        for (partition, ids) in pending.by_partition() {
            batches.entry(partition).or_default().deletions = ids;
        }

        let registry = &self.ctx.registry;
        let saves = self.local.transaction(|txn| {
            // Link every new entity first so references between them resolve.
            for info in registry.iter() {
                for mut entity in txn.dirty_entities(&info.entity_type) {
                    if entity.remote_id.is_none() && !entity.pending_deletion {
                        entity.remote_id = Some(info.partition.record_id(Uuid::new_v4().to_string()));
                        txn.update(entity)?;
                    }
                }
            }

            let mut saves = Vec::new();
            for info in registry.iter() {
                for entity in txn.dirty_entities(&info.entity_type) {
                    if entity.pending_deletion {
                        continue;
                    }
                    let Some(id) = entity.remote_id.clone() else {
                        continue;
                    };
                    if pending.contains(&id) {
                        debug!(record = %id, "dirty entity is queued for deletion; not uploading");
                        continue;
                    }
                    let references = remote_references(txn, &entity);
                    saves.push(PendingSave {
                        local_id: entity.local_id,
                        info: info.clone(),
                        record: info.to_record(&entity, id, &references),
                        sent: entity,
                    });
                }
            }
            Ok(saves)
        })?;

        for save in saves {
            batches
                .entry(save.record.id.partition.clone())
                .or_default()
                .saves
                .push(save);
        }
        Ok(batches)
    }

    async fn upload_partition(
        &self,
        partition: Partition,
        batch: PartitionBatch,
        cancel: &CancellationToken,
    ) -> SyncResult<UploadReport> {
        let mut report = UploadReport::default();
        let batch_size = self.ctx.config.push_batch_size.max(1);

        for chunk in batch.deletions.chunks(batch_size) {
            check_cancelled(cancel)?;
            self.push_deletions(&partition, chunk.to_vec(), &mut report)
                .await?;
        }

        let mut saves = batch.saves;
        while !saves.is_empty() {
            check_cancelled(cancel)?;
            let rest = saves.split_off(batch_size.min(saves.len()));
            let chunk = std::mem::replace(&mut saves, rest);
            self.push_saves(&partition, chunk, &mut report).await?;
        }

        debug!(
            partition = %partition,
            saved = report.saved,
            deleted = report.deleted,
            "partition uploaded"
        );
        Ok(report)
    }

    async fn push_deletions(
        &self,
        partition: &Partition,
        ids: Vec<RecordId>,
        report: &mut UploadReport,
    ) -> SyncResult<()> {
        let ModifyOutcome {
            deleted, failures, ..
        } = self.modify(partition, Vec::new(), ids).await?;

        let mut confirmed = deleted;
        for (id, error) in failures {
            match error {
                SyncError::UnknownItem(_) => confirmed.push(id),
                error => self.record_failure(report, id, error)?,
            }
        }

        self.ctx.pending_deletions().confirm(&confirmed)?;
        if let Some(cache) = &self.cache {
            for id in &confirmed {
                cache.remove(id)?;
            }
        }

        let mut connector = self.connector.lock();
        self.local.transaction(|txn| {
            for id in &confirmed {
                if let Some(entity) = txn.find_by_remote_id(id) {
                    txn.delete(entity.local_id);
                    connector.forget_source(entity.local_id);
                }
            }
            Ok(())
        })?;

        report.deleted += confirmed.len();
        Ok(())
    }

    async fn push_saves(
        &self,
        partition: &Partition,
        chunk: Vec<PendingSave>,
        report: &mut UploadReport,
    ) -> SyncResult<()> {
        let records: Vec<Record> = chunk.iter().map(|save| save.record.clone()).collect();
        let mut pending: HashMap<RecordId, PendingSave> = chunk
            .into_iter()
            .map(|save| (save.record.id.clone(), save))
            .collect();

        let outcome = self.modify(partition, records, Vec::new()).await?;
        for saved in outcome.saved {
            if let Some(save) = pending.remove(&saved.id) {
                self.apply_saved(&save, &saved)?;
                report.saved += 1;
            }
        }

        for (id, error) in outcome.failures {
            let Some(save) = pending.remove(&id) else {
                continue;
            };
            match error {
                SyncError::Conflict { server, .. } => {
                    self.resolve_write_conflict(partition, &save, *server, report)
                        .await?;
                }
                error => self.record_failure(report, id, error)?,
            }
        }
        Ok(())
    }

    async fn resolve_write_conflict(
        &self,
        partition: &Partition,
        save: &PendingSave,
        mut server: Record,
        report: &mut UploadReport,
    ) -> SyncResult<()> {
        let id = save.record.id.clone();
        let attempts = self.ctx.config.max_conflict_retries;

        for attempt in 1..=attempts {
            let resolution = self.ctx.resolver.resolve_write_conflict(
                &save.record,
                save.sent.modified_at,
                &save.sent.dirty,
                &server,
            );
            let resaved = match resolution {
                WriteResolution::AcceptServer => {
                    debug!(record = %id, "write conflict: server version accepted");
                    self.accept_server(save, &server)?;
                    report.conflicts_resolved += 1;
                    return Ok(());
                }
                WriteResolution::Resave(resaved) => resaved,
            };

            debug!(record = %id, attempt, "write conflict: resubmitting");
            let outcome = self.modify(partition, vec![resaved], Vec::new()).await?;
            if let Some(saved) = outcome.saved.into_iter().next() {
                self.apply_saved(save, &saved)?;
                report.saved += 1;
                report.conflicts_resolved += 1;
                return Ok(());
            }
            match outcome.failures.into_iter().next() {
                Some((_, SyncError::Conflict { server: newer, .. })) => server = *newer,
                Some((_, error)) => return self.record_failure(report, id.clone(), error),
                None => return Ok(()),
            }
        }

        warn!(record = %id, attempts, "write conflict unresolved; giving up until next upload");
        report
            .failures
            .push((id.clone(), SyncError::ConflictRetriesExhausted { id, attempts }));
        Ok(())
    }

    /// Marks a save as confirmed.
    ///
    /// Dirty flags are cleared only for fields unchanged since the record
    /// was built, so edits made during the upload are sent next time.
    fn apply_saved(&self, save: &PendingSave, saved: &Record) -> SyncResult<()> {
        if let Some(cache) = &self.cache {
            cache.put(saved.clone())?;
        }
        self.local.transaction(|txn| {
            let Some(mut entity) = txn.get(save.local_id) else {
                return Ok(());
            };
            for (name, value) in &saved.fields {
                if save.info.syncs(name)
                    && value.as_reference().is_none()
                    && unchanged_since(&entity, &save.sent, name)
                {
                    entity.fields.insert(name.clone(), value.clone());
                }
            }
            let sent_dirty = save.sent.dirty.iter();
            let cleared: Vec<String> = sent_dirty
                .filter(|name| unchanged_since(&entity, &save.sent, name))
                .cloned()
                .collect();
            for name in cleared {
                entity.dirty.remove(&name);
            }
            entity.remote_id = Some(saved.id.clone());
            entity.change_tag = saved.change_tag.clone();
            txn.update(entity)
        })
    }

    fn accept_server(&self, save: &PendingSave, server: &Record) -> SyncResult<()> {
        if let Some(cache) = &self.cache {
            cache.put(server.clone())?;
        }
        let mut connector = self.connector.lock();
        self.local.transaction(|txn| {
            let Some(mut entity) = txn.get(save.local_id) else {
                return Ok(());
            };
            let discarded: Vec<String> = save
                .sent
                .dirty
                .iter()
                .filter(|name| unchanged_since(&entity, &save.sent, name))
                .cloned()
                .collect();
            for name in discarded {
                entity.dirty.remove(&name);
            }
            save.info.load(&mut entity, server);
            txn.update(entity)?;
            connect_references(&mut connector, txn, save.local_id, &save.info, server)
        })
    }

    fn record_failure(
        &self,
        report: &mut UploadReport,
        id: RecordId,
        error: SyncError,
    ) -> SyncResult<()> {
        if (self.ctx.error_hook)(&error) == ErrorDisposition::Fatal {
            return Err(error);
        }
        warn!(record = %id, error = %error, "record not uploaded");
        report.failures.push((id, error));
        Ok(())
    }

    async fn modify(
        &self,
        partition: &Partition,
        save: Vec<Record>,
        delete: Vec<RecordId>,
    ) -> SyncResult<ModifyOutcome> {
        self.bounded(self.remote.modify_records(partition, save, delete))
            .await
    }

    async fn bounded<T>(&self, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        timeout(self.ctx.config.fetch_timeout, call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }
}

fn check_cancelled(cancel: &CancellationToken) -> SyncResult<()> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

fn unchanged_since(current: &LocalEntity, sent: &LocalEntity, name: &str) -> bool {
    current.fields.get(name) == sent.fields.get(name)
        && current.relationships.get(name) == sent.relationships.get(name)
}

/// Remote identifiers of an entity's related entities.
fn remote_references(txn: &dyn EntityTxn, entity: &LocalEntity) -> BTreeMap<String, RecordId> {
    entity
        .relationships
        .iter()
        .filter_map(|(name, target)| {
            txn.get(*target)
                .and_then(|target| target.remote_id)
                .map(|id| (name.clone(), id))
        })
        .collect()
}

fn connect_references(
    connector: &mut ReferenceConnector,
    txn: &mut dyn EntityTxn,
    source: LocalId,
    info: &EntityInfo,
    record: &Record,
) -> SyncResult<()> {
    for (field, target) in record.references() {
        if info.syncs(field) {
            connector.connect(txn, source, field, target)?;
        }
    }
    Ok(())
}
