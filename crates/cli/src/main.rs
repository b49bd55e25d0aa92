//! # CLI - LedgerStore interactive shell
//!
//! A REPL over an indexed key-value store with `u64` keys and UTF-8
//! values. Reads commands from stdin and prints results to stdout, so it
//! works both interactively and with piped scripts.
//!
//! ## Commands
//!
//! ```text
//! PUT key value       Write a value (opens a write session if needed)
//! GET key             Look up a key (prints value or "(nil)")
//! DEL key             Delete a key in the open session
//! COMMIT [min max]    End the session; optionally narrow the valid key range
//! MERGE               Merge data files per LEDGERSTORE_MERGE_POLICY
//! STATS               Print store counters
//! VERIFY              Rebuild the index from the data files and compare
//! EXIT / QUIT         Commit, save the index and shut down
//! ```
//!
//! Writes only become visible to `GET` after `COMMIT`.
//!
//! ## Configuration
//!
//! ```text
//! LEDGERSTORE_DIR       store directory          (default: "data")
//! LEDGERSTORE_NAME      store name               (default: "ledger")
//! LEDGERSTORE_CAPACITY  number of valid keys     (default: 1000000)
//! RUST_LOG              log filter               (default: "info")
//! ```
//!
//! plus every `LEDGERSTORE_*` tuning variable read by `StoreConfig::from_env`.

mod shell;

use anyhow::{Context, Result};
use config::StoreConfig;
use kvstore::{IndexedStore, RecordLayout};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

use shell::{Outcome, Shell};

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let dir = env_or("LEDGERSTORE_DIR", "data");
    let name = env_or("LEDGERSTORE_NAME", "ledger");
    let capacity: u64 = env_or("LEDGERSTORE_CAPACITY", "1000000")
        .parse()
        .context("LEDGERSTORE_CAPACITY must be an unsigned integer")?;
    let config = StoreConfig::from_env()?;

    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir))?;
    let store = IndexedStore::open(&dir, &name, RecordLayout::variable(), capacity, config)?;
    println!(
        "LedgerStore started (dir={}, name={}, capacity={}, keys={})",
        dir,
        name,
        capacity,
        store.len()
    );
    println!("Commands: PUT key value | GET key | DEL key | COMMIT [min max]");
    println!("          MERGE | STATS | VERIFY | EXIT");

    let shell = Shell::new(store);
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match shell.execute(&line) {
            Outcome::Continue(lines) => {
                for l in lines {
                    println!("{}", l);
                }
            }
            Outcome::Exit(lines) => {
                for l in lines {
                    println!("{}", l);
                }
                break;
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    shell.close()?;
    tracing::info!(store = %name, "store closed");
    Ok(())
}
