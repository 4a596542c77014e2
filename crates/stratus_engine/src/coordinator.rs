//! Sync cycle coordination.

use crate::auth::{AuthState, Authenticator};
use crate::context::SyncContext;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::local::LocalStore;
use crate::remote::RemoteStore;
use crate::synchronizer::{DownloadReport, Synchronizer, UploadReport};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratus_protocol::{Partition, QueryMode};
use tracing::{debug, info, warn};

/// The current state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Signing in before a cycle.
    Authenticating,
    /// Applying remote changes.
    Downloading,
    /// Sending local changes.
    Uploading,
    /// The last cycle completed.
    Synced,
    /// The last cycle stopped because the remote is unreachable.
    Suspended,
    /// The last cycle failed.
    Error,
    /// Waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Authenticating | SyncState::Downloading | SyncState::Uploading
        )
    }

    /// Returns true if a new cycle may start.
    pub fn can_start_sync(&self) -> bool {
        matches!(
            self,
            SyncState::Idle
                | SyncState::Synced
                | SyncState::Suspended
                | SyncState::Error
                | SyncState::RetryWait
        )
    }
}

/// Cumulative statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ran to completion.
    pub cycles_completed: u64,
    /// Remote changes applied locally.
    pub records_downloaded: u64,
    /// Records saved or deleted remotely.
    pub records_uploaded: u64,
    /// Write conflicts resolved during upload.
    pub conflicts_resolved: u64,
    /// Retries made by [`SyncCoordinator::sync_with_retry`].
    pub retries: u64,
    /// End of the last completed cycle.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Download and upload both ran.
    Completed,
    /// The remote is unreachable; the session is offline.
    Suspended,
    /// The session is not signed in.
    NotAuthenticated(AuthState),
}

/// Result of a sync cycle.
#[derive(Debug)]
pub struct SyncCycleResult {
    /// Download summary.
    pub download: DownloadReport,
    /// Upload summary.
    pub upload: UploadReport,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    fn new(outcome: CycleOutcome) -> Self {
        Self {
            download: DownloadReport::default(),
            upload: UploadReport::default(),
            outcome,
            duration: Duration::ZERO,
        }
    }

    /// Returns true if the cycle ran to completion.
    pub fn is_complete(&self) -> bool {
        self.outcome == CycleOutcome::Completed
    }
}

/// Runs authenticated download-then-upload cycles.
pub struct SyncCoordinator<R: RemoteStore, L: LocalStore> {
    ctx: Arc<SyncContext>,
    authenticator: Authenticator<R>,
    synchronizer: Arc<Synchronizer<R, L>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl<R: RemoteStore, L: LocalStore> SyncCoordinator<R, L> {
    /// Creates a coordinator around a synchronizer.
    pub fn new(synchronizer: Arc<Synchronizer<R, L>>, remote: Arc<R>) -> Self {
        let ctx = Arc::clone(synchronizer.context());
        Self {
            authenticator: Authenticator::new(Arc::clone(&ctx), remote),
            ctx,
            synchronizer,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the authenticator.
    pub fn authenticator(&self) -> &Authenticator<R> {
        &self.authenticator
    }

    /// Returns the synchronizer.
    pub fn synchronizer(&self) -> &Arc<Synchronizer<R, L>> {
        &self.synchronizer
    }

    /// Cancels the running cycle.
    pub fn cancel(&self) {
        self.synchronizer.cancel();
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn begin(&self) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_start_sync() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: "sync".into(),
            });
        }
        *state = SyncState::Authenticating;
        Ok(())
    }

    /// Runs one cycle: sign in, download, then upload.
    ///
    /// An unreachable remote switches the session offline and ends the
    /// cycle as [`CycleOutcome::Suspended`] rather than failing it.
    ///
    /// # Errors
    ///
    /// Returns authentication and fatal session errors. Another cycle
    /// already running yields [`SyncError::InvalidStateTransition`].
    pub async fn sync(
        &self,
        partitions: &[Partition],
        mode: QueryMode,
    ) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        self.begin()?;

        let mut result = match self.run_cycle(partitions, mode).await {
            Ok(result) => result,
            Err(e) if e.is_connectivity() => {
                self.ctx.auth.go_offline();
                warn!(error = %e, "remote unreachable; sync suspended");
                self.set_state(SyncState::Suspended);
                self.stats.write().last_error = Some(e.to_string());
                SyncCycleResult::new(CycleOutcome::Suspended)
            }
            Err(e) => {
                if e.class() == ErrorClass::Authentication {
                    self.ctx.auth.set(AuthState::TokenFailed);
                }
                self.set_state(SyncState::Error);
                self.stats.write().last_error = Some(e.to_string());
                return Err(e);
            }
        };
        result.duration = start.elapsed();

        if result.is_complete() {
            self.set_state(SyncState::Synced);
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.records_downloaded += result.download.applied() as u64;
            stats.records_uploaded += (result.upload.saved + result.upload.deleted) as u64;
            stats.conflicts_resolved += result.upload.conflicts_resolved as u64;
            stats.last_sync_time = Some(Instant::now());
            stats.last_error = None;
            info!(
                downloaded = result.download.applied(),
                uploaded = result.upload.saved + result.upload.deleted,
                duration_ms = result.duration.as_millis() as u64,
                "sync cycle complete"
            );
        }
        Ok(result)
    }

    async fn run_cycle(
        &self,
        partitions: &[Partition],
        mode: QueryMode,
    ) -> SyncResult<SyncCycleResult> {
        // Offline sessions re-probe the remote on every cycle.
        let was_offline = self.authenticator.state().is_offline();
        let auth = self.authenticator.authenticate(was_offline).await?;
        if auth.is_offline() {
            debug!("offline; cycle suspended");
            self.set_state(SyncState::Suspended);
            return Ok(SyncCycleResult::new(CycleOutcome::Suspended));
        }
        if !auth.is_signed_in() {
            debug!(state = ?auth, "not signed in; cycle skipped");
            self.set_state(SyncState::Idle);
            return Ok(SyncCycleResult::new(CycleOutcome::NotAuthenticated(auth)));
        }

        self.set_state(SyncState::Downloading);
        let download = self.synchronizer.download_changes(partitions, mode).await?;

        self.set_state(SyncState::Uploading);
        let upload = self.synchronizer.upload_local_changes().await?;

        Ok(SyncCycleResult {
            download,
            upload,
            outcome: CycleOutcome::Completed,
            duration: Duration::ZERO,
        })
    }

    /// Runs a cycle, retrying transient failures with backoff.
    ///
    /// A temporarily unavailable account service counts as transient.
    pub async fn sync_with_retry(
        &self,
        partitions: &[Partition],
        mode: QueryMode,
    ) -> SyncResult<SyncCycleResult> {
        let retry = &self.ctx.config.retry;
        let attempts = retry.max_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                self.set_state(SyncState::RetryWait);
                let delay = retry.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying sync");
                tokio::time::sleep(delay).await;
                self.stats.write().retries += 1;
            }

            let last = attempt + 1 == attempts;
            match self.sync(partitions, mode).await {
                Ok(result)
                    if result.outcome
                        == CycleOutcome::NotAuthenticated(AuthState::TemporarilyUnavailable)
                        && !last =>
                {
                    continue
                }
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && !last => {
                    warn!(error = %e, attempt, "sync attempt failed");
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::Remote("no sync attempts made".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncConfig};
    use crate::local::{EntityInfo, EntityRegistry, MemoryLocalStore};
    use crate::remote::{AccountStatus, MemoryRemoteStore};
    use crate::state::StateStore;
    use stratus_protocol::Record;

    fn main_zone() -> Partition {
        Partition::private("Main")
    }

    fn coordinator(
        remote: &Arc<MemoryRemoteStore>,
    ) -> (SyncCoordinator<MemoryRemoteStore, MemoryLocalStore>, Arc<MemoryLocalStore>) {
        let ctx = SyncContext::new(
            SyncConfig::new("test")
                .with_partition_names(["Main"])
                .with_retry(
                    RetryConfig::new(3)
                        .with_initial_delay(Duration::from_millis(1))
                        .with_jitter(false),
                ),
            EntityRegistry::new().with(EntityInfo::new("Note", "Note", main_zone())),
            Arc::new(StateStore::in_memory()),
        );
        let local = Arc::new(MemoryLocalStore::new());
        let sync = Arc::new(Synchronizer::new(
            Arc::new(ctx),
            Arc::clone(remote),
            Arc::clone(&local),
        ));
        (SyncCoordinator::new(sync, Arc::clone(remote)), local)
    }

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Suspended.can_start_sync());
        assert!(!SyncState::Downloading.can_start_sync());
        assert!(SyncState::Uploading.is_active());
        assert!(!SyncState::Synced.is_active());
    }

    #[tokio::test]
    async fn full_cycle_downloads_then_uploads() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (coordinator, local) = coordinator(&remote);
        coordinator.authenticator().authenticate(false).await.unwrap();
        remote.put_server_record(
            Record::new(main_zone().record_id("n1"), "Note").with_field("title", "remote"),
        );
        local.create("Note", [("title", "local")]);

        let result = coordinator.sync(&[main_zone()], QueryMode::Recent).await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.download.created, 1);
        assert_eq!(result.upload.saved, 1);
        assert_eq!(coordinator.state(), SyncState::Synced);

        let stats = coordinator.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.records_uploaded, 1);
        assert_eq!(remote.records(&main_zone()).len(), 2);
    }

    #[tokio::test]
    async fn denied_account_is_not_authenticated() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_account_status(AccountStatus::NoAccount);
        let (coordinator, _) = coordinator(&remote);

        let result = coordinator.sync(&[main_zone()], QueryMode::Recent).await.unwrap();
        assert_eq!(result.outcome, CycleOutcome::NotAuthenticated(AuthState::Denied));
        assert_eq!(coordinator.stats().cycles_completed, 0);
    }

    #[tokio::test]
    async fn unreachable_remote_suspends() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (coordinator, _) = coordinator(&remote);
        coordinator.authenticator().authenticate(false).await.unwrap();

        remote.set_reachable(false);
        let result = coordinator.sync(&[main_zone()], QueryMode::Recent).await.unwrap();
        assert_eq!(result.outcome, CycleOutcome::Suspended);
        assert_eq!(coordinator.state(), SyncState::Suspended);
        assert!(coordinator.authenticator().state().is_offline());

        // Still unreachable: the next cycle probes again and stays suspended.
        let result = coordinator.sync(&[main_zone()], QueryMode::Recent).await.unwrap();
        assert_eq!(result.outcome, CycleOutcome::Suspended);

        remote.set_reachable(true);
        let result = coordinator.sync(&[main_zone()], QueryMode::Recent).await.unwrap();
        assert!(result.is_complete());
        assert!(coordinator.authenticator().state().is_signed_in());
        assert!(!coordinator.authenticator().state().is_offline());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (coordinator, _) = coordinator(&remote);
        coordinator.authenticator().authenticate(false).await.unwrap();

        remote.fail_next_fetch(SyncError::TemporarilyUnavailable("busy".into()));
        let result = coordinator
            .sync_with_retry(&[main_zone()], QueryMode::Recent)
            .await
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(coordinator.stats().retries, 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_returned() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (coordinator, _) = coordinator(&remote);
        coordinator.authenticator().authenticate(false).await.unwrap();

        remote.fail_next_fetch(SyncError::Session("revoked".into()));
        let err = coordinator
            .sync_with_retry(&[main_zone()], QueryMode::Recent)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Session(_)));
        assert_eq!(coordinator.state(), SyncState::Error);
        assert_eq!(coordinator.stats().retries, 0);
    }
}
