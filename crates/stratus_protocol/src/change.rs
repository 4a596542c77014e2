//! Change events reported by a remote store.

use crate::record::{Record, RecordId};

/// A single remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    /// Record was created or changed; carries the full server snapshot.
    Changed(RecordId, Record),
    /// Record was deleted; carries the record type tag.
    Deleted(RecordId, String),
    /// The remote reported a change that could not be interpreted.
    Malformed,
}

impl RecordChange {
    /// Creates a deletion event.
    ///
    /// A deletion without a type tag cannot be mapped to any local entity
    /// and is reported as [`RecordChange::Malformed`].
    pub fn deleted(id: RecordId, record_type: impl Into<String>) -> Self {
        let record_type = record_type.into();
        if record_type.is_empty() {
            RecordChange::Malformed
        } else {
            RecordChange::Deleted(id, record_type)
        }
    }

    /// Creates a change event from a snapshot.
    pub fn changed(record: Record) -> Self {
        RecordChange::Changed(record.id.clone(), record)
    }

    /// Returns the record type tag, if known.
    pub fn record_type(&self) -> Option<&str> {
        match self {
            RecordChange::Changed(_, record) => Some(&record.record_type),
            RecordChange::Deleted(_, record_type) => Some(record_type),
            RecordChange::Malformed => None,
        }
    }

    /// Returns the affected record identifier, if known.
    pub fn id(&self) -> Option<&RecordId> {
        match self {
            RecordChange::Changed(id, _) | RecordChange::Deleted(id, _) => Some(id),
            RecordChange::Malformed => None,
        }
    }

    /// Returns true for deletion events.
    pub fn is_deletion(&self) -> bool {
        matches!(self, RecordChange::Deleted(..))
    }
}

/// How a change sequence selects remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Incremental fetch from the stored change token.
    #[default]
    Recent,
    /// Full resync: stored tokens are cleared before fetching.
    All,
    /// Incremental fetch that suppresses deletion events.
    CreatedOnly,
}

impl QueryMode {
    /// Returns true if this mode reports deletions.
    pub fn includes_deletions(&self) -> bool {
        !matches!(self, QueryMode::CreatedOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Partition;

    #[test]
    fn untyped_deletion_is_malformed() {
        let id = Partition::private("Main").record_id("a");
        assert_eq!(RecordChange::deleted(id.clone(), ""), RecordChange::Malformed);
        assert_eq!(
            RecordChange::deleted(id.clone(), "Note"),
            RecordChange::Deleted(id, "Note".into())
        );
    }

    #[test]
    fn change_accessors() {
        let id = Partition::private("Main").record_id("a");
        let change = RecordChange::changed(Record::new(id.clone(), "Note"));
        assert_eq!(change.record_type(), Some("Note"));
        assert_eq!(change.id(), Some(&id));
        assert!(!change.is_deletion());

        assert_eq!(RecordChange::Malformed.record_type(), None);
        assert_eq!(RecordChange::Malformed.id(), None);
    }

    #[test]
    fn query_mode_deletions() {
        assert!(QueryMode::Recent.includes_deletions());
        assert!(QueryMode::All.includes_deletions());
        assert!(!QueryMode::CreatedOnly.includes_deletions());
        assert_eq!(QueryMode::default(), QueryMode::Recent);
    }
}
