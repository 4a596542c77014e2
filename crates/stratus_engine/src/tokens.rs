//! Per-partition change tokens.

use crate::error::SyncResult;
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use stratus_protocol::Partition;
use tracing::debug;

/// Opaque server cursor marking fetch progress within a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeToken(pub Vec<u8>);

impl ChangeToken {
    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Durable change tokens, one per partition.
///
/// A partition without a token is fetched from scratch.
#[derive(Clone)]
pub struct ChangeTokenStore {
    state: Arc<StateStore>,
}

impl ChangeTokenStore {
    /// Creates a view over the persisted state.
    pub fn new(state: Arc<StateStore>) -> Self {
        Self { state }
    }

    /// Returns the token for a partition.
    pub fn token(&self, partition: &Partition) -> Option<ChangeToken> {
        self.state.read(|s| s.change_tokens.get(partition).cloned())
    }

    /// Stores the token reached by a completed fetch batch.
    pub fn set(&self, partition: &Partition, token: ChangeToken) -> SyncResult<()> {
        debug!(partition = %partition, token = %token, "change token advanced");
        self.state.update(|s| {
            s.change_tokens.insert(partition.clone(), token);
        })
    }

    /// Clears the token for a partition, forcing a full resync.
    pub fn clear(&self, partition: &Partition) -> SyncResult<bool> {
        self.state
            .update(|s| s.change_tokens.remove(partition).is_some())
    }

    /// Clears every token.
    pub fn clear_all(&self) -> SyncResult<usize> {
        self.state.update(|s| {
            let cleared = s.change_tokens.len();
            s.change_tokens.clear();
            cleared
        })
    }

    /// Returns every partition holding a token.
    pub fn partitions(&self) -> Vec<Partition> {
        self.state.read(|s| s.change_tokens.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let tokens = ChangeTokenStore::new(Arc::new(StateStore::in_memory()));
        let main = Partition::private("Main");

        assert_eq!(tokens.token(&main), None);
        tokens.set(&main, ChangeToken(vec![1, 2])).unwrap();
        assert_eq!(tokens.token(&main), Some(ChangeToken(vec![1, 2])));

        assert!(tokens.clear(&main).unwrap());
        assert!(!tokens.clear(&main).unwrap());
        assert_eq!(tokens.token(&main), None);
    }

    #[test]
    fn clear_all_tokens() {
        let tokens = ChangeTokenStore::new(Arc::new(StateStore::in_memory()));
        tokens.set(&Partition::private("A"), ChangeToken(vec![1])).unwrap();
        tokens.set(&Partition::private("B"), ChangeToken(vec![2])).unwrap();

        assert_eq!(tokens.partitions().len(), 2);
        assert_eq!(tokens.clear_all().unwrap(), 2);
        assert!(tokens.partitions().is_empty());
    }

    #[test]
    fn token_display_is_hex() {
        assert_eq!(ChangeToken(vec![0x0a, 0xff]).to_string(), "0aff");
    }
}
