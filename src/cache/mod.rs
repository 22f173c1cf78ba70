//! Generational response cache
//!
//! Responses are stored on disk grouped into transactions (generations). A
//! `CacheStore` keeps the newest `retention` transactions and deletes older ones,
//! a `Transaction` is a directory of entries, and a `CacheEntry` binds one request
//! fingerprint to one stored response.
//!
//! The store has no internal locking: it assumes a single writer per cache root.

mod entry;
mod store;
mod transaction;

pub use entry::{CacheEntry, CachedResponse, RequestDescriptor, RequestView, ResponseHead};
pub use store::CacheStore;
pub use transaction::Transaction;

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while reading or writing the cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem operation failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The control record exists but could not be parsed or written
    #[error("Invalid control record {}: {source}", path.display())]
    ControlRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A request or response descriptor could not be encoded or decoded
    #[error("Invalid entry descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    /// An entry file ended before both descriptors were read
    #[error("Truncated cache entry: {}", .0.display())]
    Truncated(PathBuf),

    /// The request payload could not be read while computing a fingerprint
    #[error("Failed to read request payload: {0}")]
    Payload(#[source] io::Error),

    /// No retained transaction has the given name
    #[error("get transaction {0:?}: no such transaction")]
    NoSuchTransaction(String),

    /// Retention must keep at least one transaction
    #[error("Invalid retention count: {0} (must be at least 1)")]
    InvalidRetention(usize),
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
