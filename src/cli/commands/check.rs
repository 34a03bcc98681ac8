//! cli::commands::check
//!
//! `check` and `stale`.

use std::process::ExitCode;

use anyhow::{Context as _, Result};

use crate::cli::Context;
use crate::core::config::LedgerConfig;
use crate::core::types::UtcTimestamp;
use crate::doctor;
use crate::engine::stale_operations;

/// Run the doctor. Exits 1 when any issue is found.
pub fn check(ctx: &Context, list: bool) -> Result<ExitCode> {
    let diagnosis = doctor::check(
        &ctx.registry,
        None,
        &UtcTimestamp::now(),
        ctx.config.stale_after(),
    )
    .context("checking ledger")?;

    if list {
        for issue in &diagnosis.issues {
            println!("issue:{}\t{}\t{}", issue.issue_id(), issue.severity(), issue);
        }
    } else if diagnosis.is_healthy() {
        println!(
            "Ledger is consistent: {} operation(s), {} pending entities.",
            diagnosis.operations, diagnosis.markers
        );
    } else {
        println!("{}", diagnosis.format());
    }

    Ok(if diagnosis.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// List operations older than the threshold, oldest first.
pub fn stale(ctx: &Context, older_than: Option<u64>) -> Result<()> {
    let threshold = match older_than {
        Some(secs) => LedgerConfig {
            stale_after_secs: secs,
            ..ctx.config.clone()
        }
        .stale_after(),
        None => ctx.config.stale_after(),
    };
    let now = UtcTimestamp::now();
    let stale = stale_operations(&ctx.registry, &now, threshold)
        .context("loading pending operations")?;

    if stale.is_empty() {
        println!(
            "No operations pending longer than {}s.",
            threshold.num_seconds()
        );
        return Ok(());
    }
    for op in &stale {
        println!(
            "{}  {:<20} {}  age {}s",
            op.id,
            op.kind,
            op.created_at,
            op.age_at(&now).num_seconds()
        );
    }
    Ok(())
}
