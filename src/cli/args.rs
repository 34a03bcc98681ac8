//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! These flags are available on all commands:
//! - `--help` / `-h`: Show help
//! - `--version`: Show version
//! - `--store <dir>`: Ledger directory (overrides `store_dir` from config)
//! - `--config <file>`: Config file (overrides the search order)
//! - `--debug`: Enable debug logging

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// opledger - inspect a pending-operation ledger
#[derive(Parser, Debug)]
#[command(name = "opledger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Ledger directory
    #[arg(long, global = true, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Config file to load instead of searching the default locations
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Parser::parse()
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List pending operations
    #[command(
        name = "list",
        long_about = "List pending operations, oldest first.\n\n\
            Each line shows the operation id, its kind, when it was created, \
            and how many actions it has recorded. Operations that are part way \
            through a rollback are marked."
    )]
    List {
        /// Only show operations of this kind (e.g. create-volume)
        #[arg(long, value_name = "KIND")]
        kind: Option<String>,
    },

    /// Show one pending operation and its actions
    #[command(name = "show")]
    Show {
        /// Operation id
        op_id: String,
    },

    /// Count operations, pending entities, actions, and pre-images
    #[command(name = "summary")]
    Summary,

    /// Check the ledger for inconsistencies
    #[command(
        name = "check",
        long_about = "Check the ledger for inconsistencies.\n\n\
            Cross-references operation records, pending markers, and pre-images: \
            markers owned by missing operations, actions whose entity is not \
            marked pending, links to missing operations, link cycles, leftover \
            pre-images, and operations pending for longer than the stale \
            threshold.\n\n\
            Exits with status 1 when any issue is found. Nothing is repaired.",
        after_help = "\
EXAMPLES:
    # Human-readable report
    opledger check --store /var/lib/opledger

    # Tab-separated output for scripts
    opledger check --list"
    )]
    Check {
        /// Machine-readable output, one issue per line
        #[arg(long)]
        list: bool,
    },

    /// List operations pending for longer than the stale threshold
    #[command(name = "stale")]
    Stale {
        /// Threshold in seconds (defaults to stale_after_secs from config)
        #[arg(long, value_name = "SECS")]
        older_than: Option<u64>,
    },
}
