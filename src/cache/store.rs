//! Cache store: transaction list, retention and the control record
//!
//! The control record (`cache.json` in the cache root) lists the retained
//! transactions newest first and is rewritten after every change.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::transaction::{name_for_millis, Transaction};
use super::CacheError;

/// File name of the control record inside the cache root
const CONTROL_RECORD: &str = "cache.json";

/// On-disk shape of the control record
#[derive(Debug, Default, Serialize, Deserialize)]
struct ControlRecord {
    #[serde(default)]
    transactions: Vec<Transaction>,
}

#[derive(Serialize)]
struct ControlRecordRef<'a> {
    transactions: &'a [Transaction],
}

/// Owns the cache root and the ordered list of retained transactions
///
/// `transactions` is kept newest first and never holds more than `retention`
/// entries once an operation returns successfully. Mutating methods take
/// `&mut self`; sharing one root between several stores is not supported.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    retention: usize,
    transactions: Vec<Transaction>,
}

impl CacheStore {
    /// Opens the store at `root`, keeping at most `retention` transactions
    ///
    /// A missing control record yields an empty store. Transactions beyond the
    /// retention count are deleted immediately and the trimmed record is saved.
    ///
    /// # Arguments
    /// * `root` - Cache directory, created if missing
    /// * `retention` - Number of transactions to keep; must be at least 1
    ///
    /// # Returns
    /// * `Ok(CacheStore)` with over-retention transactions already evicted
    /// * `Err` if the root, the control record or an eviction fails
    pub fn open(root: impl Into<PathBuf>, retention: usize) -> Result<Self, CacheError> {
        if retention == 0 {
            return Err(CacheError::InvalidRetention(retention));
        }
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;

        let transactions = load_control_record(&root)?;
        debug!(root = %root.display(), count = transactions.len(), "opened cache store");

        let mut store = Self {
            root,
            retention,
            transactions,
        };
        store.evict()?;
        store.save_control_record()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Retained transactions, newest first
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Creates a new transaction and makes it the newest one
    ///
    /// If the directory cannot be created the store is left unchanged.
    pub fn create_transaction(&mut self) -> Result<&Transaction, CacheError> {
        let now = Local::now();
        let name = self.unused_name(now.timestamp_millis());
        let tx = Transaction::create(&self.root, name, now.naive_local())?;
        info!(name = tx.name(), "created transaction");

        self.transactions.insert(0, tx);
        self.evict()?;
        self.save_control_record()?;
        Ok(&self.transactions[0])
    }

    /// Returns the newest transaction, creating one if the store is empty
    pub fn last_transaction(&mut self) -> Result<&Transaction, CacheError> {
        if self.transactions.is_empty() {
            self.create_transaction()?;
        }
        Ok(&self.transactions[0])
    }

    /// Looks up a retained transaction by name
    pub fn get_transaction(&self, name: &str) -> Result<&Transaction, CacheError> {
        self.transactions
            .iter()
            .find(|tx| tx.name() == name)
            .ok_or_else(|| CacheError::NoSuchTransaction(name.to_string()))
    }

    /// Picks a name from the millisecond clock, never at or below the newest name
    ///
    /// Evicted names are not reused, so names keep increasing with age.
    fn unused_name(&self, now_millis: i64) -> String {
        let newest = self
            .transactions
            .first()
            .and_then(|tx| i64::from_str_radix(tx.name(), 16).ok());
        let mut millis = match newest {
            Some(newest) => now_millis.max(newest + 1),
            None => now_millis,
        };
        loop {
            let name = name_for_millis(millis);
            if !self.transactions.iter().any(|tx| tx.name() == name) {
                return name;
            }
            millis += 1;
        }
    }

    /// Deletes transactions beyond the retention count, oldest last in the list
    ///
    /// A failed deletion is returned as is; directories removed before it stay removed.
    fn evict(&mut self) -> Result<(), CacheError> {
        if self.transactions.len() <= self.retention {
            return Ok(());
        }
        for tx in &self.transactions[self.retention..] {
            match fs::remove_dir_all(tx.dir()) {
                Ok(()) => info!(name = tx.name(), "evicted transaction"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(tx.dir(), e)),
            }
        }
        self.transactions.truncate(self.retention);
        Ok(())
    }

    fn control_record_path(&self) -> PathBuf {
        self.root.join(CONTROL_RECORD)
    }

    fn save_control_record(&self) -> Result<(), CacheError> {
        let path = self.control_record_path();
        let record = ControlRecordRef {
            transactions: &self.transactions,
        };
        let json = serde_json::to_string_pretty(&record).map_err(|source| CacheError::ControlRecord {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|e| CacheError::io(&path, e))
    }
}

fn load_control_record(root: &Path) -> Result<Vec<Transaction>, CacheError> {
    let path = root.join(CONTROL_RECORD);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(&path, e)),
    };
    let record: ControlRecord =
        serde_json::from_str(&content).map_err(|source| CacheError::ControlRecord { path, source })?;

    Ok(record
        .transactions
        .into_iter()
        .map(|tx| tx.attach(root))
        .collect())
}
