//! Conflict detection and resolution.

use crate::record::Record;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Outcome of resolving a local version against a remote one.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local version; it will be re-sent on the next upload.
    KeepLocal,
    /// Accept the remote version and overwrite the local entity.
    AcceptRemote,
    /// Apply a merged version; fields that differ from remote are re-sent.
    Merge(Record),
}

impl Resolution {
    /// Returns true if the local version survives in any form.
    pub fn keeps_local(&self) -> bool {
        !matches!(self, Resolution::AcceptRemote)
    }
}

/// Outcome of resolving a rejected write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResolution {
    /// Resubmit this version (carries the server's change tag).
    Resave(Record),
    /// Give up the local write and take the server version.
    AcceptServer,
}

/// Decides which version of a record wins.
///
/// Implementations must be pure: the same inputs always yield the same
/// resolution.
pub trait ConflictResolver: Send + Sync {
    /// Resolves a local version against a remote one.
    fn resolve(
        &self,
        local: &Record,
        local_modified_at: Option<DateTime<Utc>>,
        remote: &Record,
    ) -> Resolution;

    /// Resolves a local version whose fields named in `dirty` hold edits
    /// not yet uploaded.
    ///
    /// The default ignores the dirty set.
    fn resolve_edited(
        &self,
        local: &Record,
        local_modified_at: Option<DateTime<Utc>>,
        _dirty: &BTreeSet<String>,
        remote: &Record,
    ) -> Resolution {
        self.resolve(local, local_modified_at, remote)
    }

    /// Resolves a write that the server rejected because it holds a newer
    /// version.
    ///
    /// The default asks [`ConflictResolver::resolve_edited`]; when local
    /// wins, the local fields are re-saved on top of the server version so
    /// server fields the local version lacks survive.
    fn resolve_write_conflict(
        &self,
        local: &Record,
        local_modified_at: Option<DateTime<Utc>>,
        dirty: &BTreeSet<String>,
        server: &Record,
    ) -> WriteResolution {
        match self.resolve_edited(local, local_modified_at, dirty, server) {
            Resolution::AcceptRemote => WriteResolution::AcceptServer,
            Resolution::KeepLocal => {
                let mut resolved = server.clone();
                resolved.overlay_fields(local);
                WriteResolution::Resave(resolved)
            }
            Resolution::Merge(mut merged) => {
                merged.change_tag = server.change_tag.clone();
                WriteResolution::Resave(merged)
            }
        }
    }
}

/// Most recent timestamp wins.
///
/// A local version without a modification time always loses. Ties go to
/// the remote version.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn resolve(
        &self,
        _local: &Record,
        local_modified_at: Option<DateTime<Utc>>,
        remote: &Record,
    ) -> Resolution {
        match (local_modified_at, remote.modified_at) {
            (None, _) => Resolution::AcceptRemote,
            (Some(_), None) => Resolution::KeepLocal,
            (Some(local), Some(remote)) if local > remote => Resolution::KeepLocal,
            _ => Resolution::AcceptRemote,
        }
    }
}

/// Remote always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerWins;

impl ConflictResolver for ServerWins {
    fn resolve(&self, _: &Record, _: Option<DateTime<Utc>>, _: &Record) -> Resolution {
        Resolution::AcceptRemote
    }
}

/// Local wins whenever it has been modified locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWins;

impl ConflictResolver for ClientWins {
    fn resolve(
        &self,
        _local: &Record,
        local_modified_at: Option<DateTime<Utc>>,
        _remote: &Record,
    ) -> Resolution {
        if local_modified_at.is_some() {
            Resolution::KeepLocal
        } else {
            Resolution::AcceptRemote
        }
    }
}

/// Field-level merge.
///
/// Fields with unsent local edits keep their local value, as do fields
/// named with [`FieldMerge::prefer_local`]; every other field takes the
/// remote value. Without a local modification time the remote version is
/// accepted whole.
#[derive(Debug, Clone, Default)]
pub struct FieldMerge {
    local_fields: BTreeSet<String>,
}

impl FieldMerge {
    /// Creates a merge policy that keeps only locally edited fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks fields whose local value is always preferred.
    pub fn prefer_local<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_fields.extend(fields.into_iter().map(Into::into));
        self
    }
}

impl ConflictResolver for FieldMerge {
    fn resolve(
        &self,
        local: &Record,
        local_modified_at: Option<DateTime<Utc>>,
        remote: &Record,
    ) -> Resolution {
        self.resolve_edited(local, local_modified_at, &BTreeSet::new(), remote)
    }

    fn resolve_edited(
        &self,
        local: &Record,
        local_modified_at: Option<DateTime<Utc>>,
        dirty: &BTreeSet<String>,
        remote: &Record,
    ) -> Resolution {
        if local_modified_at.is_none() {
            return Resolution::AcceptRemote;
        }

        let mut merged = remote.clone();
        for name in self.local_fields.union(dirty) {
            match local.get(name) {
                Some(value) => {
                    merged.set(name.clone(), value.clone());
                }
                None => {
                    merged.remove(name);
                }
            }
        }

        if merged.has_same_content(remote) {
            Resolution::AcceptRemote
        } else if merged.has_same_content(local) {
            Resolution::KeepLocal
        } else {
            Resolution::Merge(merged)
        }
    }
}
