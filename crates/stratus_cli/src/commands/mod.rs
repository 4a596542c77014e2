//! CLI command implementations.

pub mod dump_cache;
pub mod inspect;
pub mod reset_tokens;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratus_engine::{LocalCache, StateStore, SyncError};
use stratus_storage::{DocumentStore, FileStore, StorageError};
use thiserror::Error;

/// Errors raised by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No state directory at the given path.
    #[error("no sync state found at {0}")]
    NotFound(PathBuf),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Engine failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Output encoding failure.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Output format shared by the commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// An opened state directory.
pub struct Workspace {
    /// Persisted engine state.
    pub state: Arc<StateStore>,
    /// Record cache.
    pub cache: LocalCache,
}

impl Workspace {
    /// Opens the state directory at `path`, which must exist.
    pub fn open(path: &Path) -> CliResult<Self> {
        if !path.is_dir() {
            return Err(CliError::NotFound(path.to_path_buf()));
        }
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(path)?);
        Ok(Self {
            state: Arc::new(StateStore::open(Arc::clone(&store))?),
            cache: LocalCache::open(store)?,
        })
    }
}
