//! Shared engine context.

use crate::auth::AuthHandle;
use crate::config::SyncConfig;
use crate::error::{ErrorDisposition, SyncError};
use crate::local::EntityRegistry;
use crate::state::{PendingDeletions, StateStore};
use crate::tokens::ChangeTokenStore;
use std::sync::Arc;
use stratus_protocol::{ConflictResolver, LastWriteWins};

/// Classifies errors met while consuming remote changes.
pub type ErrorHook = Arc<dyn Fn(&SyncError) -> ErrorDisposition + Send + Sync>;

/// Everything the engine components share, passed explicitly to each of
/// them.
pub struct SyncContext {
    /// Engine configuration.
    pub config: SyncConfig,
    /// Record type to entity mappings.
    pub registry: EntityRegistry,
    /// Conflict policy.
    pub resolver: Arc<dyn ConflictResolver>,
    /// Persisted sync state.
    pub state: Arc<StateStore>,
    /// Error classification for change sequences.
    pub error_hook: ErrorHook,
    /// Authentication state.
    pub auth: AuthHandle,
}

impl SyncContext {
    /// Creates a context with last-write-wins resolution and the default
    /// error classification.
    pub fn new(config: SyncConfig, registry: EntityRegistry, state: Arc<StateStore>) -> Self {
        Self {
            config,
            registry,
            resolver: Arc::new(LastWriteWins),
            state,
            error_hook: Arc::new(|error: &SyncError| error.default_disposition()),
            auth: AuthHandle::new(),
        }
    }

    /// Sets the conflict policy.
    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Sets the error classification hook.
    pub fn with_error_hook(
        mut self,
        hook: impl Fn(&SyncError) -> ErrorDisposition + Send + Sync + 'static,
    ) -> Self {
        self.error_hook = Arc::new(hook);
        self
    }

    /// Returns the change token store.
    pub fn tokens(&self) -> ChangeTokenStore {
        ChangeTokenStore::new(Arc::clone(&self.state))
    }

    /// Returns the pending deletion queue.
    pub fn pending_deletions(&self) -> PendingDeletions {
        PendingDeletions::new(Arc::clone(&self.state))
    }
}
