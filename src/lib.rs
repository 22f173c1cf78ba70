//! crawlcache library
//!
//! A replaying HTTP cache for crawlers: responses are stored in generational
//! transactions on disk, and live requests pass through an access gate that keeps
//! them a fixed interval apart.

pub mod cache;
pub mod cli;
pub mod client;
pub mod gate;
pub mod scan;

pub use cache::{CacheEntry, CacheError, CacheStore, CachedResponse, RequestDescriptor, RequestView, ResponseHead, Transaction};
pub use client::{download, Client, ClientConfig, ClientError};
pub use gate::{AccessGate, GateError, GateGuard};
pub use scan::{scan_csv, scan_zip, Scan, ScanError};
