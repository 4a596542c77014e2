//! End-to-end tests: clients syncing through an in-memory remote store.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use stratus_engine::{
    ApplyOutcome, Authenticator, ChangeToken, EntityInfo, EntityRegistry, LocalCache,
    MemoryLocalStore, MemoryRemoteStore, StateStore, SyncConfig, SyncContext, SyncCoordinator,
    SyncError, Synchronizer,
};
use stratus_protocol::{
    ConflictResolver, ConvertResult, FieldMerge, FieldValue, Partition, QueryMode, Record, RecordChange,
    RecordConvertible, Resolution, ServerWins, WriteResolution,
};
use stratus_storage::{DocumentStore, FileStore, InMemoryStore};

type NoteSync = Synchronizer<MemoryRemoteStore, MemoryLocalStore>;

fn main_zone() -> Partition {
    Partition::private("Main")
}

fn registry() -> EntityRegistry {
    EntityRegistry::new()
        .with(EntityInfo::new("Folder", "Folder", main_zone()))
        .with(EntityInfo::new("Note", "Note", main_zone()))
}

fn config() -> SyncConfig {
    SyncConfig::new("iCloud.test")
        .with_partition_names(["Main"])
        .with_upload_debounce(Duration::from_millis(20))
        .with_fetch_timeout(Duration::from_secs(5))
}

struct Client {
    sync: Arc<NoteSync>,
    local: Arc<MemoryLocalStore>,
}

async fn signed_in(remote: &Arc<MemoryRemoteStore>, ctx: SyncContext) -> Client {
    let ctx = Arc::new(ctx);
    Authenticator::new(Arc::clone(&ctx), Arc::clone(remote))
        .authenticate(false)
        .await
        .unwrap();
    let local = Arc::new(MemoryLocalStore::new());
    let sync = Arc::new(Synchronizer::new(ctx, Arc::clone(remote), Arc::clone(&local)));
    Client { sync, local }
}

async fn client(remote: &Arc<MemoryRemoteStore>) -> Client {
    let ctx = SyncContext::new(config(), registry(), Arc::new(StateStore::in_memory()));
    signed_in(remote, ctx).await
}

fn note(name: &str, title: &str) -> Record {
    Record::new(main_zone().record_id(name), "Note").with_field("title", title)
}

#[tokio::test]
async fn two_clients_converge() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = client(&remote).await;
    let b = client(&remote).await;

    let created = a.local.create("Note", [("title", "from a")]);
    a.sync.upload_local_changes().await.unwrap();

    let report = b
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert_eq!(report.created, 1);

    let remote_id = a.local.get(created).unwrap().remote_id.unwrap();
    let on_b = b.local.find(&remote_id).unwrap();
    assert_eq!(on_b.fields["title"], FieldValue::from("from a"));
    assert!(!on_b.is_dirty());

    b.local.edit(on_b.local_id, "title", "edited on b").unwrap();
    b.sync.upload_local_changes().await.unwrap();

    let report = a
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert_eq!(report.updated, 2);
    assert_eq!(
        a.local.get(created).unwrap().fields["title"],
        FieldValue::from("edited on b")
    );
}

#[tokio::test]
async fn identical_change_applied_twice_is_idempotent() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    let change = RecordChange::changed(remote.put_server_record(note("n1", "hello")));

    c.sync.process(&change, &main_zone()).unwrap();
    let once = c.local.all("Note");

    assert_eq!(
        c.sync.process(&change, &main_zone()).unwrap(),
        ApplyOutcome::Updated
    );
    let twice = c.local.all("Note");

    assert_eq!(once, twice);
    assert!(!twice[0].is_dirty());
}

#[test]
fn conflict_resolution_is_deterministic() {
    let now = Utc::now();
    let local = note("n1", "local");
    let remote = note("n1", "remote").with_modified_at(now);
    let resolver = stratus_protocol::LastWriteWins;

    let local_times = [
        None,
        Some(now - ChronoDuration::seconds(5)),
        Some(now + ChronoDuration::seconds(5)),
    ];
    for local_time in local_times {
        let first = resolver.resolve(&local, local_time, &remote);
        for _ in 0..10 {
            assert_eq!(resolver.resolve(&local, local_time, &remote), first);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Note {
    id: String,
    title: String,
    stars: i64,
}

impl RecordConvertible for Note {
    const RECORD_TYPE: &'static str = "Note";

    fn stable_id(&self) -> String {
        self.id.clone()
    }

    fn decode(record: &Record) -> ConvertResult<Self> {
        Self::check_type(record)?;
        Ok(Note {
            id: record.id.name.clone(),
            title: Self::text(record, "title")?,
            stars: Self::integer(record, "stars")?,
        })
    }

    fn encode(&self, record: &mut Record) {
        record.set("title", self.title.as_str());
        record.set("stars", self.stars);
    }
}

#[tokio::test]
async fn typed_record_round_trip() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let mut registry = EntityRegistry::new();
    registry.register_type::<Note>(main_zone());
    let ctx = SyncContext::new(config(), registry, Arc::new(StateStore::in_memory()));
    let c = signed_in(&remote, ctx).await;

    let original = Note {
        id: "n1".into(),
        title: "round trip".into(),
        stars: 4,
    };
    remote.put_server_record(original.create_record(&main_zone()));
    c.sync
        .download_changes(&[main_zone()], QueryMode::All)
        .await
        .unwrap();

    let entity = c.local.find(&original.record_id(&main_zone())).unwrap();
    let info = EntityInfo::of::<Note>(main_zone());
    let rebuilt = info.to_record(&entity, original.record_id(&main_zone()), &Default::default());
    assert_eq!(Note::decode(&rebuilt).unwrap(), original);
}

#[tokio::test]
async fn dirty_entity_queued_for_deletion_is_deleted_not_uploaded() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;

    let id = c.local.create("Note", [("title", "doomed")]);
    c.sync.upload_local_changes().await.unwrap();
    let remote_id = c.local.get(id).unwrap().remote_id.unwrap();

    c.local.edit(id, "title", "edited before delete").unwrap();
    c.sync.queue_deletion(remote_id.clone()).unwrap();

    let report = c.sync.upload_local_changes().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.saved, 0);
    assert!(remote.server_record(&remote_id).is_none());
    assert!(c.local.get(id).is_none());
    assert!(c.sync.context().pending_deletions().is_empty());
}

#[tokio::test]
async fn delete_entity_waits_for_remote_confirmation() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;

    let id = c.local.create("Note", [("title", "x")]);
    c.sync.upload_local_changes().await.unwrap();
    assert!(c.sync.delete_entity(id).unwrap());
    assert!(c.local.get(id).unwrap().pending_deletion);

    // A remote edit arriving meanwhile does not resurrect it.
    let remote_id = c.local.get(id).unwrap().remote_id.unwrap();
    let server = remote.server_record(&remote_id).unwrap();
    let change = RecordChange::changed(remote.put_server_record(server.with_field("title", "y")));
    assert_eq!(
        c.sync.process(&change, &main_zone()).unwrap(),
        ApplyOutcome::Ignored
    );

    c.sync.upload_local_changes().await.unwrap();
    assert!(c.local.get(id).is_none());
    assert!(remote.server_record(&remote_id).is_none());
}

#[tokio::test]
async fn pending_deletions_drain_monotonically() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    let present = remote.put_server_record(note("present", "x")).id;
    let absent = main_zone().record_id("absent");

    let pending = c.sync.context().pending_deletions();
    pending.queue(present.clone()).unwrap();
    pending.queue(absent.clone()).unwrap();

    let report = c.sync.upload_local_changes().await.unwrap();
    assert_eq!(report.deleted, 2);
    assert!(report.failures.is_empty());
    assert!(pending.is_empty());

    // Replaying the remote delete does not requeue anything.
    c.sync
        .download_changes(&[main_zone()], QueryMode::All)
        .await
        .unwrap();
    assert!(!pending.contains(&present));
    assert!(!pending.contains(&absent));
    assert!(pending.is_empty());
}

#[tokio::test]
async fn failed_remote_delete_stays_queued() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    let id = remote.put_server_record(note("n1", "x")).id;
    c.sync.queue_deletion(id.clone()).unwrap();

    remote.fail_next_modify(SyncError::TemporarilyUnavailable("throttled".into()));
    assert!(c.sync.upload_local_changes().await.is_err());
    assert!(c.sync.context().pending_deletions().contains(&id));

    c.sync.upload_local_changes().await.unwrap();
    assert!(c.sync.context().pending_deletions().is_empty());
}

#[tokio::test]
async fn deletion_of_unknown_record_is_a_no_op() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;

    let change = RecordChange::deleted(main_zone().record_id("never-seen"), "Note");
    assert_eq!(
        c.sync.process(&change, &main_zone()).unwrap(),
        ApplyOutcome::Ignored
    );
    assert!(c.local.is_empty());
}

#[tokio::test]
async fn remote_deletion_removes_local_entity() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    let id = remote.put_server_record(note("n1", "x")).id;
    c.sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert!(c.local.find(&id).is_some());

    remote.delete_server_record(&id);
    let report = c
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(c.local.find(&id).is_none());
}

#[tokio::test]
async fn concurrent_upload_triggers_run_one_pass() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    c.local.create("Note", [("title", "x")]);

    let first = c.sync.schedule_upload();
    let second = c.sync.schedule_upload();
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(c.sync.upload_passes(), 1);
    assert_eq!(remote.modify_batches(), vec![1]);
}

#[tokio::test]
async fn uploads_are_batched_per_partition() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    for i in 0..75 {
        c.local.create("Note", [("title", format!("note {i}"))]);
    }

    let report = c.sync.upload_local_changes().await.unwrap();
    assert_eq!(report.saved, 75);
    assert_eq!(remote.modify_batches(), vec![30, 30, 15]);
    assert!(c.local.all("Note").iter().all(|n| !n.is_dirty()));
}

#[tokio::test]
async fn newer_local_write_is_resaved_over_server() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    let id = c.local.create("Note", [("title", "v1")]);
    c.sync.upload_local_changes().await.unwrap();
    let remote_id = c.local.get(id).unwrap().remote_id.unwrap();

    // Another device writes an older edit; the local one is newer.
    let server = remote.server_record(&remote_id).unwrap();
    remote.put_server_record(
        server
            .with_field("title", "server")
            .with_modified_at(Utc::now() - ChronoDuration::hours(1)),
    );
    c.local.edit(id, "title", "local").unwrap();

    let report = c.sync.upload_local_changes().await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.saved, 1);
    assert_eq!(
        remote.server_record(&remote_id).unwrap().get("title"),
        Some(&FieldValue::from("local"))
    );
    assert!(!c.local.get(id).unwrap().is_dirty());
}

#[tokio::test]
async fn server_wins_policy_accepts_server_on_write_conflict() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ctx = SyncContext::new(config(), registry(), Arc::new(StateStore::in_memory()))
        .with_resolver(ServerWins);
    let c = signed_in(&remote, ctx).await;

    let id = c.local.create("Note", [("title", "v1")]);
    c.sync.upload_local_changes().await.unwrap();
    let remote_id = c.local.get(id).unwrap().remote_id.unwrap();

    let server = remote.server_record(&remote_id).unwrap();
    remote.put_server_record(server.with_field("title", "server"));
    c.local.edit(id, "title", "local").unwrap();

    let report = c.sync.upload_local_changes().await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);
    let entity = c.local.get(id).unwrap();
    assert_eq!(entity.fields["title"], FieldValue::from("server"));
    assert!(!entity.is_dirty());
}

#[tokio::test]
async fn field_merge_keeps_locally_edited_fields() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ctx = SyncContext::new(config(), registry(), Arc::new(StateStore::in_memory()))
        .with_resolver(FieldMerge::new());
    let c = signed_in(&remote, ctx).await;

    let first = remote.put_server_record(note("n1", "t0").with_field("body", "b0"));
    c.sync
        .process(&RecordChange::changed(first), &main_zone())
        .unwrap();
    let id = c.local.find(&main_zone().record_id("n1")).unwrap().local_id;
    c.local.edit(id, "title", "mine").unwrap();

    let newer = remote.put_server_record(
        note("n1", "theirs")
            .with_field("body", "b1")
            .with_modified_at(Utc::now() + ChronoDuration::hours(1)),
    );
    let outcome = c
        .sync
        .process(&RecordChange::changed(newer), &main_zone())
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Merged);
    let entity = c.local.get(id).unwrap();
    assert_eq!(entity.fields["title"], FieldValue::from("mine"));
    assert_eq!(entity.fields["body"], FieldValue::from("b1"));
    assert_eq!(entity.dirty, BTreeSet::from(["title".to_string()]));
}

/// Always resubmits the stale local version.
struct Stubborn;

impl ConflictResolver for Stubborn {
    fn resolve(
        &self,
        _local: &Record,
        _local_modified_at: Option<chrono::DateTime<Utc>>,
        _remote: &Record,
    ) -> Resolution {
        Resolution::KeepLocal
    }

    fn resolve_write_conflict(
        &self,
        local: &Record,
        _local_modified_at: Option<chrono::DateTime<Utc>>,
        _dirty: &BTreeSet<String>,
        _server: &Record,
    ) -> WriteResolution {
        WriteResolution::Resave(local.clone())
    }
}

#[tokio::test]
async fn conflict_retries_are_bounded() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ctx = SyncContext::new(
        config().with_max_conflict_retries(2),
        registry(),
        Arc::new(StateStore::in_memory()),
    )
    .with_resolver(Stubborn);
    let c = signed_in(&remote, ctx).await;

    let id = c.local.create("Note", [("title", "v1")]);
    c.sync.upload_local_changes().await.unwrap();
    let remote_id = c.local.get(id).unwrap().remote_id.unwrap();
    let server = remote.server_record(&remote_id).unwrap();
    remote.put_server_record(server.with_field("title", "server"));
    c.local.edit(id, "title", "local").unwrap();

    let report = c.sync.upload_local_changes().await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failures[0].1,
        SyncError::ConflictRetriesExhausted { attempts: 2, .. }
    ));
    assert!(c.local.get(id).unwrap().is_dirty());
    // First upload, the conflicting write, then two resubmissions.
    assert_eq!(remote.modify_batches(), vec![1, 1, 1, 1]);
}

#[tokio::test]
async fn references_arriving_out_of_order_are_linked() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    let folder_id = main_zone().record_id("f1");

    remote.put_server_record(
        note("n1", "child").with_field("folder", FieldValue::Reference(folder_id.clone())),
    );
    remote.put_server_record(Record::new(folder_id.clone(), "Folder").with_field("name", "Inbox"));

    let report = c
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert!(report.orphaned.is_empty());

    let folder = c.local.find(&folder_id).unwrap();
    let note = c.local.find(&main_zone().record_id("n1")).unwrap();
    assert_eq!(note.relationships["folder"], folder.local_id);
    assert!(!note.is_dirty());
    assert_eq!(c.sync.pending_references(), 0);
}

#[tokio::test]
async fn missing_reference_targets_are_reported_orphaned() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    remote.put_server_record(
        note("n1", "child")
            .with_field("folder", FieldValue::Reference(main_zone().record_id("gone"))),
    );

    let report = c
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(c.sync.pending_references(), 1);
}

#[tokio::test]
async fn download_all_filters_by_predicate() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    remote.put_server_record(note("keep", "yes"));
    remote.put_server_record(note("skip", "no"));

    let only_yes = |record: &Record| record.get("title") == Some(&FieldValue::from("yes"));
    let report = c
        .sync
        .download_all("Note", Some(&only_yes), &main_zone())
        .await
        .unwrap();

    assert_eq!(report.created, 1);
    assert!(c.local.find(&main_zone().record_id("keep")).is_some());
    assert!(c.local.find(&main_zone().record_id("skip")).is_none());
}

#[tokio::test]
async fn attached_cache_follows_downloads_and_uploads() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ctx = Arc::new(SyncContext::new(config(), registry(), Arc::new(StateStore::in_memory())));
    Authenticator::new(Arc::clone(&ctx), Arc::clone(&remote))
        .authenticate(false)
        .await
        .unwrap();
    let cache = Arc::new(LocalCache::open(Arc::new(InMemoryStore::new())).unwrap());
    let local = Arc::new(MemoryLocalStore::new());
    let sync = Synchronizer::new(ctx, Arc::clone(&remote), Arc::clone(&local))
        .with_cache(Arc::clone(&cache));

    let downloaded = remote.put_server_record(note("n1", "remote")).id;
    sync.download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert!(cache.get(&downloaded).is_some());

    let id = local.create("Note", [("title", "local")]);
    sync.upload_local_changes().await.unwrap();
    let uploaded = local.get(id).unwrap().remote_id.unwrap();
    assert_eq!(
        cache.get(&uploaded).unwrap().record.get("title"),
        Some(&FieldValue::from("local"))
    );

    remote.delete_server_record(&downloaded);
    sync.download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert!(cache.get(&downloaded).is_none());
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn expired_token_falls_back_to_full_resync() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    remote.put_server_record(note("n1", "x"));
    c.sync
        .context()
        .tokens()
        .set(&main_zone(), ChangeToken(999u64.to_le_bytes().to_vec()))
        .unwrap();

    let report = c
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert_eq!(report.created, 1);
}

#[tokio::test]
async fn fatal_download_error_keeps_token() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    remote.put_server_record(note("n1", "x"));
    remote.fail_next_fetch(SyncError::Session("revoked".into()));

    let err = c
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Session(_)));
    assert!(c.sync.context().tokens().token(&main_zone()).is_none());
}

#[tokio::test]
async fn stalled_remote_times_out() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ctx = SyncContext::new(
        config().with_fetch_timeout(Duration::from_millis(50)),
        registry(),
        Arc::new(StateStore::in_memory()),
    );
    let c = signed_in(&remote, ctx).await;
    remote.set_fetch_delay(Some(Duration::from_secs(30)));

    let err = c
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.put_server_record(note("n1", "x"));

    {
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let ctx = SyncContext::new(config(), registry(), Arc::new(StateStore::open(store).unwrap()));
        let c = signed_in(&remote, ctx).await;
        c.sync
            .download_changes(&[main_zone()], QueryMode::Recent)
            .await
            .unwrap();
        c.sync
            .queue_deletion(main_zone().record_id("later"))
            .unwrap();
    }

    let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let ctx = SyncContext::new(config(), registry(), Arc::new(StateStore::open(store).unwrap()));
    assert!(ctx.tokens().token(&main_zone()).is_some());
    assert!(ctx.pending_deletions().contains(&main_zone().record_id("later")));
    assert_eq!(remote.provision_calls(), 1);

    let c = signed_in(&remote, ctx).await;
    let report = c
        .sync
        .download_changes(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert_eq!(report.applied(), 0);
    // Provisioning was remembered across the restart.
    assert_eq!(remote.provision_calls(), 1);
}

#[tokio::test]
async fn coordinator_cycle_with_offline_fallback() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let c = client(&remote).await;
    let coordinator = SyncCoordinator::new(Arc::clone(&c.sync), Arc::clone(&remote));

    c.local.create("Note", [("title", "queued")]);
    remote.set_reachable(false);
    let result = coordinator
        .sync(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert!(!result.is_complete());
    assert!(remote.records(&main_zone()).is_empty());

    // Upload is a no-op while offline.
    let report = c.sync.upload_local_changes().await.unwrap();
    assert!(report.skipped);

    // The next cycle notices the remote is back.
    remote.set_reachable(true);
    let result = coordinator
        .sync(&[main_zone()], QueryMode::Recent)
        .await
        .unwrap();
    assert!(result.is_complete());
    assert_eq!(result.upload.saved, 1);
    assert_eq!(remote.records(&main_zone()).len(), 1);
}
