//! # Stratus Sync Engine
//!
//! Bidirectional synchronization between a local object store and a remote
//! record store.
//!
//! This crate provides:
//! - Authentication state machine gating all sync activity
//! - Per-partition change tokens for incremental fetch
//! - A pull-based, cancellable sequence of remote changes
//! - A durable merge-on-write cache of remote records
//! - Deferred linking of references that arrive out of order
//! - Download/upload reconciliation with bounded conflict retry
//! - A coordinator running download-then-upload cycles with backoff
//!
//! ## Architecture
//!
//! A sync cycle is **download-then-upload**:
//! 1. Authenticate; an unreachable remote parks the session offline
//! 2. Pull remote changes and apply them through the conflict resolver
//! 3. Upload dirty entities and queued deletions, batched per partition
//!
//! The remote store and the local store are collaborators behind the
//! [`RemoteStore`] and [`LocalStore`] traits. In-memory implementations of
//! both are provided for tests and tooling.
//!
//! ## Key Invariants
//!
//! - A change token is stored only after its page was fully consumed
//! - Delete wins over update for the same record
//! - At most one upload pass runs at a time
//! - Conflict resubmission is bounded

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod cache;
mod codec;
mod config;
mod connector;
mod context;
mod coordinator;
mod error;
mod local;
mod remote;
mod sequence;
mod state;
mod synchronizer;
mod tokens;

pub use auth::{AuthHandle, AuthState, Authenticator};
pub use cache::{CachedSnapshot, LocalCache};
pub use config::{RetryConfig, SyncConfig, DEFAULT_PUSH_BATCH_SIZE, MAX_PUSH_BATCH_SIZE};
pub use connector::{ConnectReport, PendingEdge, ReferenceConnector};
pub use context::{ErrorHook, SyncContext};
pub use coordinator::{CycleOutcome, SyncCoordinator, SyncCycleResult, SyncState, SyncStats};
pub use error::{ErrorClass, ErrorDisposition, SyncError, SyncResult};
pub use local::{
    EntityInfo, EntityRegistry, EntityTxn, LocalEntity, LocalId, LocalStore, MemoryLocalStore,
};
pub use remote::{
    AccountStatus, FetchPage, Identity, MemoryRemoteStore, ModifyOutcome, QueryPage, RemoteStore,
};
pub use sequence::RemoteChangeSequence;
pub use state::{LocalState, PendingDeletions, StateStore};
pub use synchronizer::{ApplyOutcome, DownloadReport, Synchronizer, UploadReport};
pub use tokens::{ChangeToken, ChangeTokenStore};
