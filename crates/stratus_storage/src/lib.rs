//! # Stratus Storage
//!
//! Durable document storage for the Stratus sync engine.
//!
//! Stores are **opaque document stores**: each key addresses one byte
//! document, and the store never interprets what it holds. The engine keeps
//! one document per cached record and one for its own sync state, so a
//! change to one record never rewrites unrelated ones.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral state
//! - [`FileStore`] - One file per key under a locked directory
//!
//! ## Example
//!
//! ```rust
//! use stratus_storage::{DocumentKey, DocumentStore, InMemoryStore};
//!
//! let store = InMemoryStore::new();
//! let key = DocumentKey::new(["cache", "private", "Main", "Note", "n1"]).unwrap();
//! store.write(&key, b"hello").unwrap();
//! assert_eq!(store.read(&key).unwrap(), Some(b"hello".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod key;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use key::DocumentKey;
pub use memory::InMemoryStore;
pub use store::DocumentStore;
