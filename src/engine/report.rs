//! engine::report
//!
//! Terminal outcomes and the per-action report both finalizers produce.

use serde::{Deserialize, Serialize};

use super::error::LedgerError;
use crate::core::delta::Action;
use crate::core::types::OpId;

/// How a pending operation ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Keep the workflow's effects and retire the record.
    Commit,
    /// Undo the workflow's effects and retire the record.
    Rollback,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Commit => write!(f, "commit"),
            Outcome::Rollback => write!(f, "rollback"),
        }
    }
}

/// What happened to one action.
#[derive(Debug)]
pub enum ActionOutcome {
    /// The action's terminal step took effect.
    Applied,
    /// The step had already taken effect. Holds a `StaleAction` error.
    Stale(LedgerError),
    /// Nothing to do for this action (informational links, repeats).
    Skipped,
    /// The step failed.
    Failed(LedgerError),
}

/// One action and its outcome.
#[derive(Debug)]
pub struct StepReport {
    /// The action.
    pub action: Action,
    /// What happened to it.
    pub outcome: ActionOutcome,
}

/// Result of committing or rolling back one operation.
#[derive(Debug)]
pub struct FinalizeReport {
    /// The operation.
    pub op_id: OpId,
    /// The terminal path taken.
    pub outcome: Outcome,
    /// Per-action outcomes, in walk order.
    pub steps: Vec<StepReport>,
    /// Reports of linked child operations finalized along the way.
    pub children: Vec<FinalizeReport>,
    /// Bookkeeping failure that stopped the run outside any action step.
    pub halted: Option<LedgerError>,
    /// Whether the record was retired (or was already gone).
    pub complete: bool,
}

impl FinalizeReport {
    /// Create an empty report.
    pub fn new(op_id: OpId, outcome: Outcome) -> Self {
        Self {
            op_id,
            outcome,
            steps: vec![],
            children: vec![],
            halted: None,
            complete: true,
        }
    }

    /// Record an applied step.
    pub fn record_applied(&mut self, action: Action) {
        self.steps.push(StepReport {
            action,
            outcome: ActionOutcome::Applied,
        });
    }

    /// Record a stale step.
    pub fn record_stale(&mut self, action: Action, error: LedgerError) {
        self.steps.push(StepReport {
            action,
            outcome: ActionOutcome::Stale(error),
        });
    }

    /// Record a skipped step.
    pub fn record_skipped(&mut self, action: Action) {
        self.steps.push(StepReport {
            action,
            outcome: ActionOutcome::Skipped,
        });
    }

    /// Record a failed step. Marks the report incomplete.
    pub fn record_failure(&mut self, action: Action, error: LedgerError) {
        self.steps.push(StepReport {
            action,
            outcome: ActionOutcome::Failed(error),
        });
        self.complete = false;
    }

    /// Record a failure outside any step. Marks the report incomplete.
    pub fn halt(&mut self, error: LedgerError) {
        self.halted = Some(error);
        self.complete = false;
    }

    /// Number of applied steps.
    pub fn applied_count(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Applied))
    }

    /// Number of stale steps.
    pub fn stale_count(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Stale(_)))
    }

    /// Whether any step failed or the run halted.
    pub fn has_failures(&self) -> bool {
        self.halted.is_some() || self.count(|o| matches!(o, ActionOutcome::Failed(_))) > 0
    }

    /// Whether every step was stale (and there was at least one).
    pub fn all_stale(&self) -> bool {
        !self.steps.is_empty() && self.stale_count() == self.steps.len()
    }

    /// The first failure, if any.
    pub fn first_failure(&self) -> Option<&LedgerError> {
        self.steps
            .iter()
            .find_map(|s| match &s.outcome {
                ActionOutcome::Failed(e) => Some(e),
                _ => None,
            })
            .or(self.halted.as_ref())
    }

    fn count(&self, pred: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(&s.outcome)).count()
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        if self.complete {
            format!(
                "{} of {} finished: {} applied, {} stale",
                self.outcome,
                self.op_id,
                self.applied_count(),
                self.stale_count()
            )
        } else {
            format!(
                "{} of {} incomplete: {} applied, {} stale, stopped at: {}",
                self.outcome,
                self.op_id,
                self.applied_count(),
                self.stale_count(),
                self.first_failure()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown error".into())
            )
        }
    }
}
