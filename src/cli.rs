//! Command-line interface parsing for crawlcache
//!
//! Global flags configure the cache root, the access interval and retention;
//! subcommands fetch through the cache or inspect its transactions.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::client::{default_cache_dir, ClientConfig};

/// crawlcache - replay cached HTTP responses and throttle live requests
#[derive(Parser, Debug)]
#[command(name = "crawlcache")]
#[command(about = "Replaying HTTP cache with generational transactions")]
#[command(version)]
pub struct Cli {
    /// Cache root directory (defaults to the XDG cache directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Minimum milliseconds between the end of one live request and the start of the next
    #[arg(long, global = true, default_value_t = 2000, value_name = "MS")]
    pub interval_ms: u64,

    /// Number of transactions to keep
    #[arg(long, global = true, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    pub retention: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch a URL through the cache and write the body to stdout
    ///
    /// Uses the last transaction unless --new or --transaction is given.
    Get {
        /// URL to fetch (http, https or file)
        url: String,

        /// Start a new transaction before fetching
        #[arg(long, conflicts_with = "transaction")]
        new: bool,

        /// Replay from a specific transaction
        #[arg(long, value_name = "NAME")]
        transaction: Option<String>,

        /// Print the status line and headers before the body
        #[arg(short, long)]
        include: bool,
    },

    /// List retained transactions, newest first
    Transactions,

    /// Start a new transaction and print its name
    New,
}

impl Cli {
    /// Builds the client configuration from the global flags
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            cache_dir: self.cache_dir.clone().unwrap_or_else(default_cache_dir),
            interval: Duration::from_millis(self.interval_ms),
            retention: self.retention as usize,
        }
    }

    /// Default log filter for the requested verbosity
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
