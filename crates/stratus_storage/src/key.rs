//! Hierarchical document keys.

use crate::error::{StorageError, StorageResult};
use std::fmt;

/// A path-like key made of non-empty segments.
///
/// Segments may hold any text except the empty string; stores that map
/// keys onto a filesystem escape them as needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    segments: Vec<String>,
}

impl DocumentKey {
    /// Creates a key from its segments.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if there are no segments or any
    /// segment is empty.
    pub fn new<I, S>(segments: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(StorageError::InvalidKey("key has no segments".into()));
        }
        if segments.iter().any(String::is_empty) {
            return Err(StorageError::InvalidKey(format!(
                "empty segment in {}",
                segments.join("/")
            )));
        }
        Ok(Self { segments })
    }

    /// Returns a key extended by one segment.
    pub fn child(&self, segment: impl Into<String>) -> StorageResult<Self> {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    /// Returns the key segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the last segment.
    pub fn name(&self) -> &str {
        // Keys always have at least one segment.
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Returns true if `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &DocumentKey) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}
