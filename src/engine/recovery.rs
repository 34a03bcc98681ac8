//! engine::recovery
//!
//! Start-up recovery of operations left pending by a crash.
//!
//! # Architecture
//!
//! The ledger never decides on its own whether an interrupted workflow
//! should be kept or undone. Recovery scans every persisted record and asks
//! a caller-supplied [`DecisionLog`] for each one:
//!
//! - a decided record is finalized with [`finalize`]
//! - a record whose rollback already started is always rolled back, since
//!   its effects are partly undone
//! - a record claimed as a child by another live record is left to its
//!   parent, which finalizes it as part of its own walk
//! - everything else stays pending and is reported as undecided
//!
//! Records older than the stale threshold are listed separately so an
//! operator can chase them down.
//!
//! Finalizers release only the markers of entities their record names. A
//! crash between enrolling an entity and saving the action leaves a marker
//! no record mentions, so once the pass is over recovery sweeps the
//! markers still owned by operations it retired.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use super::commit::CommitFinalizer;
use super::error::{LedgerError, Result};
use super::registry::Registry;
use super::report::{FinalizeReport, Outcome};
use super::rollback::RollbackEngine;
use crate::core::config::LedgerConfig;
use crate::core::ops::PendingOperation;
use crate::core::types::{EntityId, OpId, UtcTimestamp};
use crate::entities::EntityStore;

/// Source of commit/rollback decisions for interrupted workflows.
pub trait DecisionLog {
    /// The decided outcome for `op`, if the workflow reached a decision.
    fn decision(&self, op: &OpId) -> Option<Outcome>;
}

impl DecisionLog for HashMap<OpId, Outcome> {
    fn decision(&self, op: &OpId) -> Option<Outcome> {
        self.get(op).copied()
    }
}

impl DecisionLog for BTreeMap<OpId, Outcome> {
    fn decision(&self, op: &OpId) -> Option<Outcome> {
        self.get(op).copied()
    }
}

/// Finalize `op` along the path `outcome` selects.
///
/// # Errors
///
/// Whatever [`CommitFinalizer::commit`] or [`RollbackEngine::rollback`]
/// returns.
pub fn finalize(
    registry: &Registry,
    entities: &dyn EntityStore,
    op: &PendingOperation,
    outcome: Outcome,
) -> Result<FinalizeReport> {
    match outcome {
        Outcome::Commit => CommitFinalizer::new(registry).commit(op),
        Outcome::Rollback => RollbackEngine::new(registry, entities).rollback(op),
    }
}

/// What a recovery pass did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Operations that were finalized (completely or not).
    pub finalized: Vec<FinalizeReport>,
    /// Operations with no decision, left pending.
    pub undecided: Vec<OpId>,
    /// Undecided operations older than the stale threshold.
    pub stale: Vec<OpId>,
    /// Child operations left for their parent to finalize.
    pub deferred: Vec<OpId>,
    /// Operations whose finalization could not start.
    pub errors: Vec<(OpId, LedgerError)>,
    /// Leftover markers of retired operations that were released.
    pub swept: Vec<EntityId>,
}

impl RecoveryReport {
    /// Whether every finalized operation was retired and nothing errored.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.finalized.iter().all(|r| r.complete)
    }
}

/// Cold-start recovery over a registry.
pub struct Recovery<'a> {
    registry: &'a Registry,
    entities: &'a dyn EntityStore,
    stale_after: chrono::Duration,
}

impl<'a> Recovery<'a> {
    pub fn new(registry: &'a Registry, entities: &'a dyn EntityStore) -> Self {
        Self {
            registry,
            entities,
            stale_after: LedgerConfig::default().stale_after(),
        }
    }

    /// Override the age after which an operation counts as stale.
    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Scan all records and finalize those the log has decided.
    ///
    /// # Errors
    ///
    /// Only a failure to list or load the records. Per-operation failures
    /// are collected in the report.
    pub fn recover(&self, log: &dyn DecisionLog) -> Result<RecoveryReport> {
        let ops = self.registry.load_all()?;
        let claimed: BTreeSet<OpId> = ops
            .iter()
            .flat_map(|op| op.children().cloned())
            .collect();
        let now = UtcTimestamp::now();
        let mut report = RecoveryReport::default();

        debug!(count = ops.len(), "recovering pending operations");
        for op in &ops {
            if claimed.contains(&op.id) {
                debug!(op = %op.id, "deferring child operation to its parent");
                report.deferred.push(op.id.clone());
                continue;
            }

            let outcome = match (log.decision(&op.id), op.rollback_started()) {
                (Some(Outcome::Commit), true) => {
                    warn!(op = %op.id, "commit decided for a partly rolled-back operation, resuming rollback");
                    Some(Outcome::Rollback)
                }
                (_, true) => Some(Outcome::Rollback),
                (decision, false) => decision,
            };

            let Some(outcome) = outcome else {
                report.undecided.push(op.id.clone());
                if op.age_at(&now) > self.stale_after {
                    report.stale.push(op.id.clone());
                }
                continue;
            };

            match finalize(self.registry, self.entities, op, outcome) {
                Ok(finalized) => {
                    if !finalized.complete {
                        warn!(op = %op.id, summary = %finalized.summary(), "recovery left operation incomplete");
                    }
                    report.finalized.push(finalized);
                }
                Err(err) => {
                    warn!(op = %op.id, error = %err, "could not finalize during recovery");
                    report.errors.push((op.id.clone(), err));
                }
            }
        }

        let mut retired = BTreeSet::new();
        for finalized in &report.finalized {
            collect_retired(finalized, &mut retired);
        }
        match self.registry.sweep_markers(&retired) {
            Ok(swept) => report.swept = swept,
            Err(err) => warn!(error = %err, "could not sweep leftover markers"),
        }

        info!(
            finalized = report.finalized.len(),
            undecided = report.undecided.len(),
            deferred = report.deferred.len(),
            swept = report.swept.len(),
            errors = report.errors.len(),
            "recovery pass finished"
        );
        Ok(report)
    }

    /// Operations older than the stale threshold at `now`, oldest first.
    pub fn stale_operations(&self, now: &UtcTimestamp) -> Result<Vec<PendingOperation>> {
        stale_operations(self.registry, now, self.stale_after)
    }
}

/// Ids of `report` and its children whose records were retired.
fn collect_retired(report: &FinalizeReport, out: &mut BTreeSet<OpId>) {
    if report.complete {
        out.insert(report.op_id.clone());
    }
    for child in &report.children {
        collect_retired(child, out);
    }
}

/// Operations older than `stale_after` at `now`, oldest first.
pub fn stale_operations(
    registry: &Registry,
    now: &UtcTimestamp,
    stale_after: chrono::Duration,
) -> Result<Vec<PendingOperation>> {
    let mut stale: Vec<PendingOperation> = registry
        .load_all()?
        .into_iter()
        .filter(|op| op.age_at(now) > stale_after)
        .collect();
    stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(stale)
}
