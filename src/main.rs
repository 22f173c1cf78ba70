//! crawlcache - fetch through a replaying HTTP cache
//!
//! Bodies go to stdout; logs go to stderr.

use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crawlcache::cli::{Cli, Command};
use crawlcache::{CachedResponse, Client};

/// Installs the stderr log subscriber; `RUST_LOG` overrides the verbosity flags
fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Cancels pending gate waits on Ctrl-C
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling pending requests");
            cancel.cancel();
        }
    });
}

/// Writes the response to stdout, optionally preceded by its head
fn write_response(response: &mut CachedResponse, include: bool) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if include {
        writeln!(out, "{} {}", response.head.proto, response.head.status)?;
        for (name, values) in &response.head.headers {
            for value in values {
                writeln!(out, "{}: {}", name, value)?;
            }
        }
        writeln!(out)?;
    }
    io::copy(response.body_mut(), &mut out)?;
    out.flush()
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let mut client = Client::new(&cli.client_config(), cancel)?;

    match cli.command {
        Command::Get {
            url,
            new,
            transaction,
            include,
        } => {
            if new {
                client.new_transaction()?;
            } else if let Some(name) = transaction {
                client.set_transaction(&name)?;
            } else {
                client.last_transaction()?;
            }
            let mut response = client.get(&url).await?;
            write_response(&mut response, include)?;
        }
        Command::Transactions => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for tx in client.store().transactions() {
                writeln!(out, "{}\t{}", tx.name(), tx.created_at().format("%Y-%m-%d %H:%M:%S%.3f"))?;
            }
        }
        Command::New => {
            let tx = client.new_transaction()?;
            println!("{}", tx.name());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_filter());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
