//! Error types for the sync engine.

use stratus_protocol::{ConvertError, Partition, Record, RecordId};
use stratus_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Broad category of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Account unavailable or denied; needs user action.
    Authentication,
    /// Infrastructure hiccup; safe to retry later.
    Transient,
    /// No network; sync is suspended, not failed.
    Connectivity,
    /// Write conflict; resolved automatically.
    Conflict,
    /// Per-record bad data; skipped and logged.
    Malformed,
    /// Cancels the whole pass.
    FatalSession,
    /// Local persistence failure.
    Local,
}

/// What a change sequence does with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Cancel the sequence and surface the error.
    Fatal,
    /// Log and skip the affected record.
    RecordLocal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No signed-in session.
    #[error("not signed in")]
    NotSignedIn,

    /// The remote service asked us to back off.
    #[error("service temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// The remote service is unreachable.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A write was rejected because the server holds a newer version.
    #[error("write conflict on {id}")]
    Conflict {
        /// Conflicting record.
        id: RecordId,
        /// The server's current version.
        server: Box<Record>,
    },

    /// A write kept conflicting after every resubmission.
    #[error("conflict on {id} unresolved after {attempts} attempts")]
    ConflictRetriesExhausted {
        /// Conflicting record.
        id: RecordId,
        /// Resubmissions made.
        attempts: u32,
    },

    /// The stored change token is no longer accepted.
    #[error("change token expired for {0}")]
    ChangeTokenExpired(Partition),

    /// The partition does not exist on the remote.
    #[error("partition not found: {0}")]
    PartitionNotFound(Partition),

    /// The record does not exist on the remote.
    #[error("unknown item: {0}")]
    UnknownItem(RecordId),

    /// The remote returned data that could not be interpreted.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// A record could not be converted.
    #[error("conversion failed: {0}")]
    Convert(#[from] ConvertError),

    /// A record type has no registered entity mapping.
    #[error("unknown record type: {0}")]
    UnknownRecordType(String),

    /// The session is no longer usable.
    #[error("session error: {0}")]
    Session(String),

    /// Durable storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding or decoding of persisted state failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The local persistence adapter failed.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// A sync cycle is already running.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The remote did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// Any other remote failure.
    #[error("remote error: {0}")]
    Remote(String),
}

impl SyncError {
    /// Classifies this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::NotSignedIn => ErrorClass::Authentication,
            SyncError::TemporarilyUnavailable(_) | SyncError::Timeout | SyncError::Remote(_) => {
                ErrorClass::Transient
            }
            SyncError::NetworkUnavailable(_) => ErrorClass::Connectivity,
            SyncError::Conflict { .. } | SyncError::ConflictRetriesExhausted { .. } => {
                ErrorClass::Conflict
            }
            SyncError::Malformed(_)
            | SyncError::Convert(_)
            | SyncError::UnknownRecordType(_)
            | SyncError::UnknownItem(_) => ErrorClass::Malformed,
            SyncError::ChangeTokenExpired(_)
            | SyncError::PartitionNotFound(_)
            | SyncError::Session(_)
            | SyncError::InvalidStateTransition { .. }
            | SyncError::Cancelled => ErrorClass::FatalSession,
            SyncError::Storage(_) | SyncError::Codec(_) | SyncError::LocalStore(_) => {
                ErrorClass::Local
            }
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Connectivity)
    }

    /// Returns true if this error means the remote is unreachable.
    pub fn is_connectivity(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }

    /// Default disposition inside a change sequence.
    pub fn default_disposition(&self) -> ErrorDisposition {
        match self.class() {
            ErrorClass::Malformed | ErrorClass::Conflict => ErrorDisposition::RecordLocal,
            _ => ErrorDisposition::Fatal,
        }
    }
}
