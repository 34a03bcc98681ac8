//! cli
//!
//! Command-line interface layer for opledger.
//!
//! # Responsibilities
//!
//! - Parse command-line arguments and global flags
//! - Load configuration and install the log subscriber
//! - Open the ledger directory and delegate to command handlers
//!
//! The CLI only inspects a ledger. Starting, committing, and rolling back
//! operations is the job of the workflows embedding the library.

pub mod args;
pub mod commands;

pub use args::Cli;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tracing_subscriber::EnvFilter;

use crate::core::config::{Config, LedgerConfig};
use crate::engine::Registry;
use crate::store::FileStore;

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "OPLEDGER_LOG";

/// Shared state for command handlers.
#[derive(Debug)]
pub struct Context {
    /// Registry over the opened ledger directory.
    pub registry: Registry,
    /// Effective configuration.
    pub config: LedgerConfig,
    /// The ledger directory.
    pub store_dir: PathBuf,
}

/// Run the CLI application.
///
/// This is the main entry point called from `main.rs`.
pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse_args();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    init_logging(cli.debug, config.ledger.log_filter.as_deref());
    if let Some(path) = config.loaded_from() {
        tracing::debug!(path = %path.display(), "loaded configuration");
    }

    let ctx = open(cli.store.clone(), config.ledger)?;
    commands::dispatch(cli.command, &ctx)
}

/// Open the ledger directory named by the flag or the config.
fn open(flag: Option<PathBuf>, config: LedgerConfig) -> Result<Context> {
    let Some(store_dir) = flag.or_else(|| config.store_dir.clone()) else {
        bail!("no ledger directory: pass --store or set store_dir in the config file");
    };
    if !store_dir.is_dir() {
        bail!("ledger directory '{}' does not exist", store_dir.display());
    }
    let store = FileStore::open(store_dir.clone())
        .with_context(|| format!("opening ledger at '{}'", store_dir.display()))?;
    let registry = Registry::with_config(Arc::new(store), &config);
    Ok(Context {
        registry,
        config,
        store_dir,
    })
}

/// Install the stderr subscriber.
///
/// `--debug` wins over `OPLEDGER_LOG`, which wins over the config's
/// `log_filter`. The default only shows warnings.
fn init_logging(debug: bool, configured: Option<&str>) {
    let filter = if debug {
        EnvFilter::new("opledger=debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("warn")))
    };
    // A subscriber may already be installed when embedded; keep that one.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
