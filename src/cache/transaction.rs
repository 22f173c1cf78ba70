//! Transactions (cache generations)

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, RequestDescriptor, RequestView};
use super::CacheError;

/// A generation of cached entries stored in its own directory
///
/// Transactions are created and evicted by `CacheStore`; this type is only a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    name: String,
    #[serde(rename = "create_at", with = "create_at_format")]
    created_at: NaiveDateTime,
    #[serde(skip)]
    dir: PathBuf,
}

impl Transaction {
    /// Creates the directory for a new transaction under `root`
    pub(crate) fn create(root: &Path, name: String, created_at: NaiveDateTime) -> Result<Self, CacheError> {
        let dir = root.join(&name);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(Self {
            name,
            created_at,
            dir,
        })
    }

    /// Rebinds a transaction read from the control record to its directory
    pub(crate) fn attach(mut self, root: &Path) -> Self {
        self.dir = root.join(&self.name);
        self
    }

    /// Transaction name (lowercase hex of the creation time in Unix milliseconds)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the entry handle for a request
    ///
    /// Fails only when the request payload cannot be read.
    pub fn entry_for<R: RequestView + ?Sized>(&self, request: &R) -> Result<CacheEntry, CacheError> {
        let descriptor = RequestDescriptor::from_view(request)?;
        Ok(CacheEntry::new(descriptor, &self.dir))
    }
}

/// Derives a transaction name from a Unix millisecond timestamp
pub(crate) fn name_for_millis(millis: i64) -> String {
    format!("{:x}", millis)
}

mod create_at_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}
