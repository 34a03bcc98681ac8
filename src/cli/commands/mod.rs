//! cli::commands
//!
//! Command dispatch and handlers.
//!
//! # Architecture
//!
//! Each command handler:
//! 1. Validates command-specific arguments
//! 2. Reads the ledger through the registry or the doctor
//! 3. Formats and displays output
//!
//! Handlers never write to the ledger.

mod check;
mod inspect;

pub use check::{check, stale};
pub use inspect::{list, show, summary};

use std::process::ExitCode;

use anyhow::Result;

use super::args::Command;
use super::Context;

/// Dispatch a command to its handler.
pub fn dispatch(command: Command, ctx: &Context) -> Result<ExitCode> {
    match command {
        Command::List { kind } => list(ctx, kind.as_deref()).map(|()| ExitCode::SUCCESS),
        Command::Show { op_id } => show(ctx, &op_id).map(|()| ExitCode::SUCCESS),
        Command::Summary => summary(ctx).map(|()| ExitCode::SUCCESS),
        Command::Check { list } => check(ctx, list),
        Command::Stale { older_than } => stale(ctx, older_than).map(|()| ExitCode::SUCCESS),
    }
}
