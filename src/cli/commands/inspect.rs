//! cli::commands::inspect
//!
//! `list`, `show`, and `summary`.

use anyhow::{anyhow, Context as _, Result};

use crate::cli::Context;
use crate::core::kinds::OperationKind;
use crate::core::ops::PendingOperation;
use crate::core::types::{OpId, UtcTimestamp};
use crate::doctor;
use crate::engine::LedgerError;

/// List pending operations, oldest first.
pub fn list(ctx: &Context, kind: Option<&str>) -> Result<()> {
    let kind = kind
        .map(|name| {
            OperationKind::from_name(name).ok_or_else(|| {
                let known: Vec<&str> = OperationKind::ALL.iter().map(|k| k.name()).collect();
                anyhow!("unknown operation kind '{}' (expected one of: {})", name, known.join(", "))
            })
        })
        .transpose()?;

    let mut ops: Vec<PendingOperation> = ctx
        .registry
        .load_all()
        .context("loading pending operations")?
        .into_iter()
        .filter(|op| kind.map_or(true, |k| op.kind == k))
        .collect();
    ops.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if ops.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }
    let now = UtcTimestamp::now();
    for op in &ops {
        println!("{}", list_line(op, &now));
    }
    Ok(())
}

fn list_line(op: &PendingOperation, now: &UtcTimestamp) -> String {
    let mut line = format!(
        "{}  {:<20} {}  age {}s  {} action(s)",
        op.id,
        op.kind,
        op.created_at,
        op.age_at(now).num_seconds(),
        op.len()
    );
    if op.rollback_started() {
        line.push_str(&format!("  [rolling back: {}/{} undone]", op.undone(), op.len()));
    }
    line
}

/// Show one operation, its actions, and what a rollback would do.
pub fn show(ctx: &Context, op_id: &str) -> Result<()> {
    let id = OpId::parse(op_id).map_err(|e| anyhow!("invalid operation id '{}': {}", op_id, e))?;
    let op = match ctx.registry.load(&id) {
        Ok(op) => op,
        Err(LedgerError::NotFound(_)) => {
            return Err(anyhow!("no pending operation '{}'", id));
        }
        Err(e) => return Err(e).context("loading operation"),
    };

    println!("Operation: {}", op.id);
    println!("Kind:      {}", op.kind);
    println!("Created:   {}", op.created_at);
    if op.rollback_started() {
        println!("Rollback:  {} of {} actions undone", op.undone(), op.len());
    }
    println!();
    println!("Actions:");
    let first_undone = op.len() - op.undone();
    for (i, action) in op.actions().iter().enumerate() {
        let marker = if i >= first_undone { " (undone)" } else { "" };
        let owner = match action.change().entity_kind() {
            Some(_) => match ctx.registry.owner(action.entity_id())? {
                Some(m) if m.op_id == op.id => "",
                Some(_) => "  [pending under another operation]",
                None => "  [not pending]",
            },
            None => "",
        };
        println!("  {:>3}. {}{}{}", i + 1, action.describe(), marker, owner);
    }

    let summary = op.rollback_summary();
    if summary.total_items() > 0 {
        println!();
        println!("Rollback would:");
        for id in &summary.children {
            println!("  unwind child operation {}", id);
        }
        for id in &summary.removals {
            println!("  remove {}", id);
        }
        for id in &summary.restores {
            println!("  restore {}", id);
        }
        for id in &summary.resizes {
            println!("  resize {}", id);
        }
        for id in &summary.reattaches {
            println!("  re-attach {}", id);
        }
    }
    Ok(())
}

/// Print ledger counts.
pub fn summary(ctx: &Context) -> Result<()> {
    let summary = doctor::summarize(&ctx.registry).context("summarizing ledger")?;
    println!("Ledger: {}", ctx.store_dir.display());
    println!("{}", summary);
    Ok(())
}
