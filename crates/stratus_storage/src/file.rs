//! File-based document store for persistent storage.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! ├─ LOCK                       # Advisory lock for single-writer
//! └─ <segment>/.../<name>.doc   # One file per document
//! ```

use crate::error::{StorageError, StorageResult};
use crate::key::DocumentKey;
use crate::store::DocumentStore;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const DOC_EXTENSION: &str = ".doc";
const TEMP_EXTENSION: &str = ".tmp";

/// A directory-backed document store.
///
/// Each document lives in its own file, so writing one record never
/// rewrites another. Data survives process restarts.
///
/// # Durability
///
/// - `write()` writes a temporary file, syncs it, then renames it over the
///   target, so a crash leaves either the old or the new document
/// - `sync()` syncs the root directory entry on platforms that allow it
///
/// # Thread Safety
///
/// The store holds an exclusive lock on its directory; only one `FileStore`
/// may be open per directory at a time.
///
/// # Example
///
/// ```no_run
/// use stratus_storage::{DocumentKey, DocumentStore, FileStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("sync-state")).unwrap();
/// let key = DocumentKey::new(["state", "local"]).unwrap();
/// store.write(&key, b"persistent data").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path exists but is not a directory
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(root: &Path) -> StorageResult<Self> {
        if !root.exists() {
            fs::create_dir_all(root)?;
        }
        if !root.is_dir() {
            return Err(StorageError::Corrupted(format!(
                "path is not a directory: {}",
                root.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.display().to_string()));
        }

        debug!(root = %root.display(), "opened file store");

        Ok(Self {
            root: root.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, key: &DocumentKey) -> PathBuf {
        let mut path = self.dir_path(&key.segments()[..key.segments().len() - 1]);
        path.push(format!("{}{}", escape(key.name()), DOC_EXTENSION));
        path
    }

    fn dir_path(&self, segments: &[String]) -> PathBuf {
        let mut path = self.root.clone();
        for segment in segments {
            path.push(escape(segment));
        }
        path
    }

    fn walk(&self, dir: &Path, prefix: &[String], out: &mut Vec<DocumentKey>) -> StorageResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                let mut segments = prefix.to_vec();
                segments.push(unescape(file_name)?);
                self.walk(&entry.path(), &segments, out)?;
            } else if let Some(stem) = file_name.strip_suffix(DOC_EXTENSION) {
                let mut segments = prefix.to_vec();
                segments.push(unescape(stem)?);
                out.push(DocumentKey::new(segments)?);
            }
        }
        Ok(())
    }
}

impl DocumentStore for FileStore {
    fn read(&self, key: &DocumentKey) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.document_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &DocumentKey, data: &[u8]) -> StorageResult<()> {
        let path = self.document_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(TEMP_EXTENSION);
        let temp_path = PathBuf::from(temp_name);

        {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &DocumentKey) -> StorageResult<bool> {
        match fs::remove_file(self.document_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &DocumentKey) -> StorageResult<Vec<DocumentKey>> {
        let mut keys = Vec::new();
        if self.document_path(prefix).is_file() {
            keys.push(prefix.clone());
        }
        self.walk(
            &self.dir_path(prefix.segments()),
            prefix.segments(),
            &mut keys,
        )?;
        keys.sort();
        Ok(keys)
    }

    fn sync(&self) -> StorageResult<()> {
        #[cfg(unix)]
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

/// Escapes a key segment into a portable file name.
fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, byte) in segment.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Reverses [`escape`].
fn unescape(name: &str) -> StorageResult<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name
                .get(i + 1..i + 3)
                .ok_or_else(|| StorageError::Corrupted(format!("bad escape in {name}")))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| StorageError::Corrupted(format!("bad escape in {name}")))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| StorageError::Corrupted(format!("non-UTF-8 name {name}")))
}
