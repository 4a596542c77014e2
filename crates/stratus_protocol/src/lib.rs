//! # Stratus Protocol
//!
//! Record model and conflict rules shared by the Stratus sync engine.
//!
//! This crate provides:
//! - `Record`, `RecordId` and `Partition` for remote-addressable snapshots
//! - `FieldValue` for typed record fields, including references
//! - `RecordChange` for change events produced by a remote store
//! - `ConflictResolver` and the built-in resolution policies
//! - `RecordConvertible` for typed conversion of application structs
//!
//! This is a pure model crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod convert;
mod record;

pub use change::{QueryMode, RecordChange};
pub use conflict::{
    ClientWins, ConflictResolver, FieldMerge, LastWriteWins, Resolution, ServerWins,
    WriteResolution,
};
pub use convert::{ConvertError, ConvertResult, RecordConvertible};
pub use record::{FieldValue, Partition, Record, RecordId, Scope};
