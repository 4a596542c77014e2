//! Pull-based sequence of remote changes.
//!
//! One task per partition pages through `fetch_changes` and hands each page
//! to the consumer over a bounded channel. The consumer pulls one change at
//! a time with [`RemoteChangeSequence::next`].
//!
//! ## Invariants
//!
//! - A partition's change token is stored only after the consumer has pulled
//!   every change of the page that produced it, so a crash replays at most
//!   one page per partition
//! - The first fatal error is returned by the next pull and ends the sequence
//! - The sequence ends when every partition reports no more changes

use crate::config::SyncConfig;
use crate::context::ErrorHook;
use crate::error::{ErrorDisposition, SyncError, SyncResult};
use crate::remote::{FetchPage, RemoteStore};
use crate::tokens::{ChangeToken, ChangeTokenStore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use stratus_protocol::{Partition, QueryMode, RecordChange};
use tokio::sync::mpsc;
use tokio::time::{error::Elapsed, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Batch {
    partition: Partition,
    changes: Vec<RecordChange>,
    token: ChangeToken,
}

type ErrorSlot = Arc<Mutex<Option<SyncError>>>;

/// Restartable stream of remote changes across partitions.
///
/// Restarting means starting a new sequence, which resumes from the stored
/// tokens.
pub struct RemoteChangeSequence {
    receiver: mpsc::Receiver<Batch>,
    buffered: VecDeque<RecordChange>,
    uncommitted: Option<(Partition, ChangeToken)>,
    error: ErrorSlot,
    tokens: ChangeTokenStore,
    cancel: CancellationToken,
    fetch_timeout: Duration,
    finished: bool,
    failed: bool,
}

struct FetchTask<R> {
    remote: Arc<R>,
    partition: Partition,
    token: Option<ChangeToken>,
    mode: QueryMode,
    sender: mpsc::Sender<Batch>,
    tokens: ChangeTokenStore,
    hook: ErrorHook,
    error: ErrorSlot,
    cancel: CancellationToken,
}

enum Wake {
    Cancelled,
    Received(Result<Option<Batch>, Elapsed>),
}

impl RemoteChangeSequence {
    /// Starts fetching `partitions`.
    ///
    /// In [`QueryMode::All`] the stored tokens of `partitions` are cleared
    /// first. `cancel` stops the sequence from outside.
    pub fn start<R: RemoteStore>(
        remote: Arc<R>,
        partitions: &[Partition],
        mode: QueryMode,
        tokens: ChangeTokenStore,
        hook: ErrorHook,
        config: &SyncConfig,
        cancel: CancellationToken,
    ) -> SyncResult<Self> {
        if mode == QueryMode::All {
            for partition in partitions {
                tokens.clear(partition)?;
            }
        }

        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let error: ErrorSlot = Arc::new(Mutex::new(None));

        for partition in partitions {
            let task = FetchTask {
                remote: Arc::clone(&remote),
                partition: partition.clone(),
                token: tokens.token(partition),
                mode,
                sender: sender.clone(),
                tokens: tokens.clone(),
                hook: Arc::clone(&hook),
                error: Arc::clone(&error),
                cancel: cancel.clone(),
            };
            tokio::spawn(task.run());
        }

        debug!(partitions = partitions.len(), mode = ?mode, "change sequence started");

        Ok(Self {
            receiver,
            buffered: VecDeque::new(),
            uncommitted: None,
            error,
            tokens,
            cancel,
            fetch_timeout: config.fetch_timeout,
            finished: false,
            failed: false,
        })
    }

    /// Pulls the next change.
    ///
    /// Returns `None` once every partition is exhausted, or after an error
    /// has been returned.
    pub async fn next(&mut self) -> Option<SyncResult<RecordChange>> {
        loop {
            if self.failed {
                return None;
            }
            let stored = self.error.lock().take();
            if let Some(error) = stored {
                return Some(Err(self.fail(error)));
            }
            if self.finished && self.buffered.is_empty() && self.uncommitted.is_none() {
                return None;
            }
            if let Some(change) = self.buffered.pop_front() {
                return Some(Ok(change));
            }
            if let Err(e) = self.commit() {
                return Some(Err(self.fail(e)));
            }
            if self.finished {
                return None;
            }

            let cancel = self.cancel.clone();
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                received = timeout(self.fetch_timeout, self.receiver.recv()) => Wake::Received(received),
            };

            match wake {
                Wake::Received(Ok(Some(batch))) => {
                    self.buffered.extend(batch.changes);
                    self.uncommitted = Some((batch.partition, batch.token));
                }
                Wake::Received(Ok(None)) => self.finished = true,
                Wake::Received(Err(_)) => {
                    warn!(timeout = ?self.fetch_timeout, "no remote changes arrived in time");
                    return Some(Err(self.fail(SyncError::Timeout)));
                }
                Wake::Cancelled => {
                    let error = self.error.lock().take().unwrap_or(SyncError::Cancelled);
                    return Some(Err(self.fail(error)));
                }
            }
        }
    }

    /// Pulls every remaining change.
    pub async fn collect_all(mut self) -> SyncResult<Vec<RecordChange>> {
        let mut changes = Vec::new();
        while let Some(change) = self.next().await {
            changes.push(change?);
        }
        Ok(changes)
    }

    /// Cancels the sequence; the next pull returns [`SyncError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns the token that cancels this sequence.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn commit(&mut self) -> SyncResult<()> {
        if let Some((partition, token)) = self.uncommitted.take() {
            self.tokens.set(&partition, token)?;
        }
        Ok(())
    }

    fn fail(&mut self, error: SyncError) -> SyncError {
        self.cancel.cancel();
        self.finished = true;
        self.failed = true;
        self.buffered.clear();
        self.uncommitted = None;
        error
    }
}

impl Drop for RemoteChangeSequence {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<R: RemoteStore> FetchTask<R> {
    async fn run(mut self) {
        let mut restarted = false;
        loop {
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return,
                fetched = self.remote.fetch_changes(&self.partition, self.token.as_ref()) => fetched,
            };

            let page = match fetched {
                Ok(page) => page,
                Err(SyncError::ChangeTokenExpired(_)) if !restarted => {
                    warn!(partition = %self.partition, "change token expired; refetching partition");
                    restarted = true;
                    self.token = None;
                    if let Err(e) = self.tokens.clear(&self.partition) {
                        self.report(e);
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    self.report(e);
                    return;
                }
            };

            let FetchPage {
                changes,
                failures,
                token,
                more_coming,
            } = page;

            for (id, failure) in failures {
                if (self.hook)(&failure) == ErrorDisposition::Fatal {
                    self.report(failure);
                    return;
                }
                warn!(partition = %self.partition, record = %id, error = %failure, "skipping record");
            }

            let changes: Vec<RecordChange> = changes
                .into_iter()
                .filter(|change| self.mode.includes_deletions() || !change.is_deletion())
                .collect();
            debug!(partition = %self.partition, changes = changes.len(), more_coming, "fetched page");

            self.token = Some(token.clone());
            let batch = Batch {
                partition: self.partition.clone(),
                changes,
                token,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                sent = self.sender.send(batch) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }

            if !more_coming {
                return;
            }
        }
    }

    fn report(&self, error: SyncError) {
        if (self.hook)(&error) == ErrorDisposition::RecordLocal {
            warn!(partition = %self.partition, error = %error, "abandoning partition");
            return;
        }
        self.error.lock().get_or_insert(error);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::state::StateStore;
    use stratus_protocol::Record;

    fn main_zone() -> Partition {
        Partition::private("Main")
    }

    fn note(name: &str) -> Record {
        Record::new(main_zone().record_id(name), "Note").with_field("title", name)
    }

    fn hook() -> ErrorHook {
        Arc::new(|e: &SyncError| e.default_disposition())
    }

    fn start(
        remote: &Arc<MemoryRemoteStore>,
        mode: QueryMode,
        tokens: &ChangeTokenStore,
    ) -> RemoteChangeSequence {
        RemoteChangeSequence::start(
            Arc::clone(remote),
            &[main_zone()],
            mode,
            tokens.clone(),
            hook(),
            &SyncConfig::default().with_fetch_timeout(Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn tokens() -> ChangeTokenStore {
        ChangeTokenStore::new(Arc::new(StateStore::in_memory()))
    }

    #[tokio::test]
    async fn pages_through_all_changes() {
        let remote = Arc::new(MemoryRemoteStore::new().with_page_size(2));
        for i in 0..5 {
            remote.put_server_record(note(&format!("n{i}")));
        }
        let tokens = tokens();

        let changes = start(&remote, QueryMode::Recent, &tokens)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(changes.len(), 5);
        assert!(tokens.token(&main_zone()).is_some());

        // Resumes from the stored token.
        remote.put_server_record(note("n5"));
        let changes = start(&remote, QueryMode::Recent, &tokens)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn missing_token_is_full_resync() {
        let remote = Arc::new(MemoryRemoteStore::new());
        for i in 0..3 {
            remote.put_server_record(note(&format!("n{i}")));
        }

        let recent = start(&remote, QueryMode::Recent, &tokens())
            .collect_all()
            .await
            .unwrap();
        let all = start(&remote, QueryMode::All, &tokens())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(recent, all);
    }

    #[tokio::test]
    async fn all_mode_clears_tokens() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.put_server_record(note("n1"));
        let tokens = tokens();

        start(&remote, QueryMode::Recent, &tokens)
            .collect_all()
            .await
            .unwrap();
        let all = start(&remote, QueryMode::All, &tokens)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn created_only_suppresses_deletions() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.put_server_record(note("n1"));
        remote.put_server_record(note("n2"));
        remote.delete_server_record(&main_zone().record_id("n1"));

        let changes = start(&remote, QueryMode::CreatedOnly, &tokens())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| !c.is_deletion()));
    }

    #[tokio::test]
    async fn token_commits_after_page_is_consumed() {
        let remote = Arc::new(MemoryRemoteStore::new().with_page_size(2));
        for i in 0..4 {
            remote.put_server_record(note(&format!("n{i}")));
        }
        let tokens = tokens();
        let mut sequence = start(&remote, QueryMode::Recent, &tokens);

        sequence.next().await.unwrap().unwrap();
        sequence.next().await.unwrap().unwrap();
        assert_eq!(tokens.token(&main_zone()), None);

        sequence.next().await.unwrap().unwrap();
        assert_eq!(
            tokens.token(&main_zone()),
            Some(ChangeToken(2u64.to_le_bytes().to_vec()))
        );
    }

    #[tokio::test]
    async fn expired_token_restarts_partition() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.put_server_record(note("n1"));
        let tokens = tokens();
        tokens
            .set(&main_zone(), ChangeToken(1u64.to_le_bytes().to_vec()))
            .unwrap();
        remote.fail_next_fetch(SyncError::ChangeTokenExpired(main_zone()));

        let changes = start(&remote, QueryMode::Recent, &tokens)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn fatal_error_surfaces_on_next_pull() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.add_partition(main_zone());
        remote.fail_next_fetch(SyncError::Session("revoked".into()));

        let mut sequence = start(&remote, QueryMode::Recent, &tokens());
        assert!(matches!(
            sequence.next().await,
            Some(Err(SyncError::Session(_)))
        ));
        assert!(sequence.next().await.is_none());
    }

    #[tokio::test]
    async fn record_local_failures_are_skipped() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.put_server_record(note("n1"));
        remote.fail_record_in_next_fetch(
            main_zone().record_id("bad"),
            SyncError::Malformed("unreadable".into()),
        );

        let changes = start(&remote, QueryMode::Recent, &tokens())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn stalled_remote_times_out() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.add_partition(main_zone());
        remote.set_fetch_delay(Some(Duration::from_secs(30)));

        let mut sequence = RemoteChangeSequence::start(
            Arc::clone(&remote),
            &[main_zone()],
            QueryMode::Recent,
            tokens(),
            hook(),
            &SyncConfig::default().with_fetch_timeout(Duration::from_millis(50)),
            CancellationToken::new(),
        )
        .unwrap();
        assert!(matches!(sequence.next().await, Some(Err(SyncError::Timeout))));
    }

    #[tokio::test]
    async fn cancellation_stops_the_sequence() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.add_partition(main_zone());
        remote.set_fetch_delay(Some(Duration::from_secs(30)));

        let mut sequence = start(&remote, QueryMode::Recent, &tokens());
        sequence.cancel();
        assert!(matches!(
            sequence.next().await,
            Some(Err(SyncError::Cancelled))
        ));
    }
}
