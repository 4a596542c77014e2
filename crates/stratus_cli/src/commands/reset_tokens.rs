//! Reset tokens command implementation.

use super::{CliResult, Workspace};
use std::path::Path;
use stratus_engine::ChangeTokenStore;
use stratus_protocol::Partition;
use tracing::info;

/// Clears the change token of `partition`, or of every partition.
///
/// The next download of a cleared partition is a full resync. Returns the
/// number of tokens cleared.
pub fn clear(path: &Path, partition: Option<&Partition>) -> CliResult<usize> {
    let workspace = Workspace::open(path)?;
    let tokens = ChangeTokenStore::new(workspace.state);
    let cleared = match partition {
        Some(partition) => usize::from(tokens.clear(partition)?),
        None => tokens.clear_all()?,
    };
    info!(cleared, "change tokens reset");
    Ok(cleared)
}

/// Runs the reset-tokens command.
pub fn run(path: &Path, partition: Option<&Partition>) -> CliResult<()> {
    let cleared = clear(path, partition)?;
    match partition {
        Some(partition) if cleared == 0 => println!("No change token stored for {partition}"),
        Some(partition) => println!("Cleared change token for {partition}"),
        None => println!("Cleared {cleared} change token(s)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stratus_engine::{ChangeToken, StateStore};
    use stratus_storage::{DocumentStore, FileStore};
    use tempfile::tempdir;

    fn seed(path: &Path, partitions: &[Partition]) {
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(path).unwrap());
        let tokens = ChangeTokenStore::new(Arc::new(StateStore::open(store).unwrap()));
        for partition in partitions {
            tokens.set(partition, ChangeToken(vec![1])).unwrap();
        }
    }

    #[test]
    fn clears_one_partition() {
        let dir = tempdir().unwrap();
        let main = Partition::private("Main");
        let other = Partition::private("Other");
        seed(dir.path(), &[main.clone(), other.clone()]);

        assert_eq!(clear(dir.path(), Some(&main)).unwrap(), 1);
        assert_eq!(clear(dir.path(), Some(&main)).unwrap(), 0);
        assert_eq!(clear(dir.path(), None).unwrap(), 1);
    }
}
