//! Authentication state machine.
//!
//! Every sync activity is gated on [`AuthState`]. Only `Authenticated`
//! sessions talk to the remote; `Offline` sessions keep local changes
//! queued until connectivity returns.

use crate::context::SyncContext;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::remote::{AccountStatus, Identity, RemoteStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Authentication state of the sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No session.
    SignedOut,
    /// Sign-in in progress.
    SigningIn,
    /// The account cannot be used.
    Denied,
    /// The session token was rejected during sync.
    TokenFailed,
    /// Signed in and online.
    Authenticated(Identity),
    /// Signed in, remote unreachable.
    Offline(Identity),
    /// The account service asked us to retry later.
    TemporarilyUnavailable,
    /// Sign-in failed.
    Failed(String),
}

impl AuthState {
    /// Returns true for `Authenticated` and `Offline`.
    pub fn is_signed_in(&self) -> bool {
        matches!(self, AuthState::Authenticated(_) | AuthState::Offline(_))
    }

    /// Returns true for `SignedOut`, `Denied` and `TokenFailed`.
    pub fn is_signed_out(&self) -> bool {
        matches!(
            self,
            AuthState::SignedOut | AuthState::Denied | AuthState::TokenFailed
        )
    }

    /// Returns true for `Offline`.
    pub fn is_offline(&self) -> bool {
        matches!(self, AuthState::Offline(_))
    }

    /// Returns the signed-in identity.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::Authenticated(identity) | AuthState::Offline(identity) => Some(identity),
            _ => None,
        }
    }

    /// Returns the offline form of an authenticated state.
    pub fn convert_to_offline(&self) -> AuthState {
        match self {
            AuthState::Authenticated(identity) => AuthState::Offline(identity.clone()),
            other => other.clone(),
        }
    }
}

/// Shared, observable authentication state.
#[derive(Clone)]
pub struct AuthHandle {
    sender: Arc<watch::Sender<AuthState>>,
}

impl AuthHandle {
    /// Creates a handle in the `SignedOut` state.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(AuthState::SignedOut);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> AuthState {
        self.sender.borrow().clone()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.sender.subscribe()
    }

    /// Replaces the state.
    pub fn set(&self, state: AuthState) {
        debug!(state = ?state, "authentication state changed");
        self.sender.send_replace(state);
    }

    /// Moves an authenticated session offline.
    ///
    /// Returns true if the state changed.
    pub fn go_offline(&self) -> bool {
        let current = self.current();
        let offline = current.convert_to_offline();
        if offline == current {
            return false;
        }
        info!("remote unreachable; switching to offline mode");
        self.set(offline);
        true
    }
}

impl Default for AuthHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives [`AuthState`] transitions against the remote account service.
pub struct Authenticator<R: RemoteStore> {
    ctx: Arc<SyncContext>,
    remote: Arc<R>,
}

impl<R: RemoteStore> Authenticator<R> {
    /// Creates an authenticator.
    pub fn new(ctx: Arc<SyncContext>, remote: Arc<R>) -> Self {
        Self { ctx, remote }
    }

    /// Returns the current state.
    pub fn state(&self) -> AuthState {
        self.ctx.auth.current()
    }

    /// Signs in.
    ///
    /// Does nothing unless the session is signed out (including denied and
    /// token-failed sessions), temporarily unavailable, or offline with
    /// `even_if_offline` set. Transient failures park the session in
    /// `TemporarilyUnavailable`; any other failure moves it to `Failed` and
    /// is returned.
    pub async fn authenticate(&self, even_if_offline: bool) -> SyncResult<AuthState> {
        let current = self.state();
        let may_sign_in = current.is_signed_out()
            || current == AuthState::TemporarilyUnavailable
            || (even_if_offline && current.is_offline());
        if !may_sign_in {
            debug!(state = ?current, "authentication not required");
            return Ok(current);
        }

        self.ctx.auth.set(AuthState::SigningIn);
        match self.sign_in().await {
            Ok(state) => {
                self.ctx.auth.set(state.clone());
                Ok(state)
            }
            Err(e) if e.is_connectivity() && current.is_offline() => {
                debug!(error = %e, "remote still unreachable");
                self.ctx.auth.set(current.clone());
                Ok(current)
            }
            Err(e) if e.class() == ErrorClass::Transient => {
                warn!(error = %e, "account service temporarily unavailable");
                self.ctx.auth.set(AuthState::TemporarilyUnavailable);
                Ok(AuthState::TemporarilyUnavailable)
            }
            Err(e) => {
                error!(error = %e, "sign-in failed");
                self.ctx.auth.set(AuthState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn sign_in(&self) -> SyncResult<AuthState> {
        match self.remote.account_status().await? {
            AccountStatus::Available => {}
            AccountStatus::TemporarilyUnavailable => {
                return Err(SyncError::TemporarilyUnavailable(
                    "account status unavailable".into(),
                ))
            }
            status => {
                warn!(status = ?status, "account cannot be used for sync");
                return Ok(AuthState::Denied);
            }
        }

        let identity = self.remote.current_identity().await?;
        self.remember_identity(&identity)?;

        if !self.remote.check_connectivity().await {
            info!(identity = %identity, "signed in while offline");
            return Ok(AuthState::Offline(identity));
        }

        self.provision(false).await?;
        info!(identity = %identity, "signed in");
        Ok(AuthState::Authenticated(identity))
    }

    /// Signs out and forgets the last identity.
    pub fn sign_out(&self) -> SyncResult<()> {
        self.ctx.state.update(|s| s.last_identity = None)?;
        self.ctx.auth.set(AuthState::SignedOut);
        info!("signed out");
        Ok(())
    }

    /// Provisions the configured partitions even if already provisioned.
    pub async fn reload_partitions(&self) -> SyncResult<()> {
        self.provision(true).await
    }

    async fn provision(&self, force: bool) -> SyncResult<()> {
        let names: BTreeSet<String> = self.ctx.config.partition_names.iter().cloned().collect();
        let already = self
            .ctx
            .state
            .read(|s| s.provisioned_partitions.as_ref() == Some(&names));
        if already && !force {
            debug!("partitions already provisioned");
            return Ok(());
        }

        let list: Vec<String> = names.iter().cloned().collect();
        self.remote.provision_partitions(&list).await?;
        self.ctx
            .state
            .update(|s| s.provisioned_partitions = Some(names))?;
        info!(partitions = ?list, "partitions provisioned");
        Ok(())
    }

    fn remember_identity(&self, identity: &Identity) -> SyncResult<()> {
        let previous = self.ctx.state.read(|s| s.last_identity.clone());
        if previous.as_ref() == Some(identity) {
            return Ok(());
        }
        if let Some(previous) = previous {
            warn!(previous = %previous, current = %identity, "signed-in identity changed");
        }
        self.ctx
            .state
            .update(|s| s.last_identity = Some(identity.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::local::EntityRegistry;
    use crate::remote::{FetchPage, MemoryRemoteStore, ModifyOutcome, QueryPage};
    use crate::state::StateStore;
    use crate::tokens::ChangeToken;
    use stratus_protocol::{Partition, Record, RecordId};

    fn setup() -> (Authenticator<MemoryRemoteStore>, Arc<MemoryRemoteStore>, Arc<SyncContext>) {
        let ctx = Arc::new(SyncContext::new(
            SyncConfig::new("test").with_partition_names(["Main"]),
            EntityRegistry::new(),
            Arc::new(StateStore::in_memory()),
        ));
        let remote = Arc::new(MemoryRemoteStore::new());
        (
            Authenticator::new(Arc::clone(&ctx), Arc::clone(&remote)),
            remote,
            ctx,
        )
    }

    #[test]
    fn state_predicates() {
        let id = Identity::new("u");
        assert!(AuthState::Authenticated(id.clone()).is_signed_in());
        assert!(AuthState::Offline(id.clone()).is_signed_in());
        assert!(AuthState::TokenFailed.is_signed_out());
        assert!(AuthState::Denied.is_signed_out());
        assert!(!AuthState::SigningIn.is_signed_in());
        assert_eq!(
            AuthState::Authenticated(id.clone()).convert_to_offline(),
            AuthState::Offline(id)
        );
        assert_eq!(AuthState::Denied.convert_to_offline(), AuthState::Denied);
    }

    #[tokio::test]
    async fn sign_in_provisions_partitions() {
        let (auth, remote, ctx) = setup();

        let state = auth.authenticate(false).await.unwrap();
        assert_eq!(state, AuthState::Authenticated(Identity::new("user-1")));
        assert!(remote.has_partition(&Partition::private("Main")));
        assert_eq!(
            ctx.state.snapshot().last_identity,
            Some(Identity::new("user-1"))
        );
    }

    #[tokio::test]
    async fn provisioning_is_skipped_for_same_names() {
        let (auth, remote, _ctx) = setup();

        auth.authenticate(false).await.unwrap();
        auth.sign_out().unwrap();
        auth.authenticate(false).await.unwrap();
        assert_eq!(remote.provision_calls(), 1);

        auth.reload_partitions().await.unwrap();
        assert_eq!(remote.provision_calls(), 2);
    }

    #[tokio::test]
    async fn unavailable_account_is_denied() {
        let (auth, remote, _ctx) = setup();
        remote.set_account_status(AccountStatus::NoAccount);

        assert_eq!(auth.authenticate(false).await.unwrap(), AuthState::Denied);
        assert!(auth.state().is_signed_out());
    }

    #[tokio::test]
    async fn denied_session_can_sign_in_again() {
        let (auth, remote, _ctx) = setup();
        remote.set_account_status(AccountStatus::NoAccount);
        assert_eq!(auth.authenticate(false).await.unwrap(), AuthState::Denied);

        remote.set_account_status(AccountStatus::Available);
        assert_eq!(
            auth.authenticate(false).await.unwrap(),
            AuthState::Authenticated(Identity::new("user-1"))
        );
    }

    #[tokio::test]
    async fn unreachable_remote_signs_in_offline() {
        let (auth, remote, _ctx) = setup();
        remote.set_reachable(false);

        let state = auth.authenticate(false).await.unwrap();
        assert!(state.is_offline());
        assert_eq!(remote.provision_calls(), 0);

        // Offline sessions only re-check when asked to.
        remote.set_reachable(true);
        assert!(auth.authenticate(false).await.unwrap().is_offline());
        assert_eq!(
            auth.authenticate(true).await.unwrap(),
            AuthState::Authenticated(Identity::new("user-1"))
        );
    }

    #[tokio::test]
    async fn transient_failure_is_reenterable() {
        let (auth, remote, _ctx) = setup();
        remote.set_account_status(AccountStatus::TemporarilyUnavailable);

        assert_eq!(
            auth.authenticate(false).await.unwrap(),
            AuthState::TemporarilyUnavailable
        );

        remote.set_account_status(AccountStatus::Available);
        assert!(auth.authenticate(false).await.unwrap().is_signed_in());
    }

    #[tokio::test]
    async fn other_failures_are_returned() {
        let failing = Authenticator::new(
            Arc::new(SyncContext::new(
                SyncConfig::new("test"),
                EntityRegistry::new(),
                Arc::new(StateStore::in_memory()),
            )),
            Arc::new(FailingIdentity),
        );

        assert!(matches!(
            failing.authenticate(false).await,
            Err(SyncError::Session(_))
        ));
        assert!(matches!(failing.state(), AuthState::Failed(_)));

        // Failed sessions stay put until signed out.
        assert!(matches!(
            failing.authenticate(false).await.unwrap(),
            AuthState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn sign_out_clears_identity() {
        let (auth, _remote, ctx) = setup();
        auth.authenticate(false).await.unwrap();

        auth.sign_out().unwrap();
        assert_eq!(auth.state(), AuthState::SignedOut);
        assert_eq!(ctx.state.snapshot().last_identity, None);
    }

    struct FailingIdentity;

    #[async_trait::async_trait]
    impl RemoteStore for FailingIdentity {
        async fn account_status(&self) -> SyncResult<AccountStatus> {
            Ok(AccountStatus::Available)
        }

        async fn current_identity(&self) -> SyncResult<Identity> {
            Err(SyncError::Session("identity lookup rejected".into()))
        }

        async fn check_connectivity(&self) -> bool {
            true
        }

        async fn provision_partitions(&self, _: &[String]) -> SyncResult<()> {
            Ok(())
        }

        async fn fetch_changes(
            &self,
            partition: &Partition,
            _: Option<&ChangeToken>,
        ) -> SyncResult<FetchPage> {
            Err(SyncError::PartitionNotFound(partition.clone()))
        }

        async fn query_records(
            &self,
            partition: &Partition,
            _: &str,
            _: Option<&[u8]>,
        ) -> SyncResult<QueryPage> {
            Err(SyncError::PartitionNotFound(partition.clone()))
        }

        async fn modify_records(
            &self,
            partition: &Partition,
            _: Vec<Record>,
            _: Vec<RecordId>,
        ) -> SyncResult<ModifyOutcome> {
            Err(SyncError::PartitionNotFound(partition.clone()))
        }
    }
}
