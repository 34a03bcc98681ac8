//! engine::commit
//!
//! Retire a pending operation whose workflow succeeded.
//!
//! The actions are walked once in append order. Each named entity's pending
//! marker is released, linked child operations that are still pending are
//! committed the same way, and finally the record's pre-images and the
//! record itself are deleted.
//!
//! Commit is safe to re-run: a marker that is already gone (or was taken
//! over after an earlier partial commit) and a record that no longer exists
//! are reported as stale steps rather than errors.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::error::{LedgerError, Result};
use super::registry::Registry;
use super::report::{ActionOutcome, FinalizeReport, Outcome};
use crate::core::delta::Action;
use crate::core::kinds::ChangeKind;
use crate::core::ops::{PendingOperation, Release};
use crate::core::types::EntityId;

/// Releases locks and retires committed operations.
pub struct CommitFinalizer<'a> {
    registry: &'a Registry,
}

impl<'a> CommitFinalizer<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Commit `op`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidAction`] if a rollback has already started on
    /// the record; errors loading the record. Failures while releasing are
    /// recorded in the report instead.
    pub fn commit(&self, op: &PendingOperation) -> Result<FinalizeReport> {
        self.commit_at(op, 0)
    }

    fn commit_at(&self, op: &PendingOperation, depth: usize) -> Result<FinalizeReport> {
        let mut report = FinalizeReport::new(op.id.clone(), Outcome::Commit);

        let Some(current) = self.registry.try_load(&op.id)? else {
            debug!(op = %op.id, "record already gone, nothing to commit");
            for action in op.actions() {
                report.record_stale(action.clone(), gone(op, action));
            }
            return Ok(report);
        };
        if current.rollback_started() {
            return Err(LedgerError::InvalidAction(format!(
                "operation {} is partially rolled back and cannot be committed",
                current.id
            )));
        }

        let mut released: HashSet<&EntityId> = HashSet::new();
        for action in current.actions() {
            let outcome = match action.change() {
                ChangeKind::ChildOperation => self.commit_child(action, depth, &mut report),
                change if change.entity_kind().is_none() => ActionOutcome::Skipped,
                _ if !released.insert(action.entity_id()) => ActionOutcome::Skipped,
                _ => self.release(&current, action),
            };
            match outcome {
                ActionOutcome::Failed(err) => {
                    warn!(op = %current.id, action = %action.describe(), error = %err, "commit step failed");
                    report.record_failure(action.clone(), err);
                    return Ok(report);
                }
                ActionOutcome::Stale(err) => {
                    warn!(op = %current.id, error = %err, "stale action during commit");
                    report.record_stale(action.clone(), err);
                }
                ActionOutcome::Applied => report.record_applied(action.clone()),
                ActionOutcome::Skipped => report.record_skipped(action.clone()),
            }
        }

        if let Err(err) = self.retire(&current) {
            warn!(op = %current.id, error = %err, "could not retire committed operation");
            report.halt(err);
            return Ok(report);
        }
        info!(
            op = %current.id,
            kind = %current.kind,
            released = report.applied_count(),
            "committed"
        );
        Ok(report)
    }

    fn release(&self, op: &PendingOperation, action: &Action) -> ActionOutcome {
        let entity = action.entity_id();
        match self.registry.locks().release(&op.id, entity) {
            Ok(Release::Released) => ActionOutcome::Applied,
            Ok(Release::NotHeld) => ActionOutcome::Stale(LedgerError::StaleAction {
                op: op.id.clone(),
                action: action.describe(),
                reason: format!("{} is no longer pending", entity),
            }),
            Ok(Release::HeldByOther(owner)) => ActionOutcome::Stale(LedgerError::StaleAction {
                op: op.id.clone(),
                action: action.describe(),
                reason: format!("{} is now pending under {}", entity, owner),
            }),
            Err(err) => ActionOutcome::Failed(err.into()),
        }
    }

    fn commit_child(
        &self,
        action: &Action,
        depth: usize,
        report: &mut FinalizeReport,
    ) -> ActionOutcome {
        let child_id = match action.child_operation() {
            Ok(id) => id.clone(),
            Err(err) => return ActionOutcome::Failed(err.into()),
        };
        if depth + 1 > self.registry.max_link_depth() {
            return ActionOutcome::Failed(LedgerError::LinkDepthExceeded {
                op: child_id,
                limit: self.registry.max_link_depth(),
            });
        }
        let child = match self.registry.try_load(&child_id) {
            Ok(Some(child)) => child,
            Ok(None) => {
                return ActionOutcome::Stale(LedgerError::StaleAction {
                    op: report.op_id.clone(),
                    action: action.describe(),
                    reason: "child operation already finalized".into(),
                })
            }
            Err(err) => return ActionOutcome::Failed(err),
        };
        match self.commit_at(&child, depth + 1) {
            Ok(sub) => {
                let complete = sub.complete;
                report.children.push(sub);
                if complete {
                    ActionOutcome::Applied
                } else {
                    ActionOutcome::Failed(LedgerError::ChildIncomplete { child: child_id })
                }
            }
            Err(err) => ActionOutcome::Failed(err),
        }
    }

    /// Drop pre-images and delete the record it was read from.
    ///
    /// Markers enrolled but never recorded are left to the recovery sweep.
    fn retire(&self, op: &PendingOperation) -> Result<()> {
        let dropped = self.registry.drop_preimages(&op.id)?;
        self.registry.delete_record(op)?;
        debug!(op = %op.id, preimages = dropped, "retired operation");
        Ok(())
    }
}

fn gone(op: &PendingOperation, action: &Action) -> LedgerError {
    LedgerError::StaleAction {
        op: op.id.clone(),
        action: action.describe(),
        reason: "operation already finalized".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::delta::Delta;
    use crate::core::kinds::{EntityKind, OperationKind};
    use crate::core::types::OpId;
    use crate::entities::EntitySnapshot;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStore::new()))
    }

    fn entity(id: &str) -> EntityId {
        EntityId::new(id).unwrap()
    }

    #[test]
    fn expand_volume_scenario() {
        let registry = registry();
        let mut op = registry.create(OperationKind::ExpandVolume).unwrap();
        registry
            .append(
                &mut op,
                ChangeKind::ExpandVolume,
                entity("vol-1"),
                Some(Delta::Size(5)),
            )
            .unwrap();
        registry.save(&mut op).unwrap();
        assert_eq!(op.actions()[0].expand_size().unwrap(), 5);

        let report = CommitFinalizer::new(&registry).commit(&op).unwrap();
        assert!(report.complete, "{}", report.summary());
        assert_eq!(report.applied_count(), 1);
        assert!(registry.owner(&entity("vol-1")).unwrap().is_none());
        assert!(matches!(registry.load(&op.id), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn second_commit_is_stale() {
        let registry = registry();
        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddBrick, entity("b1"), None)
            .unwrap();
        let finalizer = CommitFinalizer::new(&registry);
        finalizer.commit(&op).unwrap();

        let again = finalizer.commit(&op).unwrap();
        assert!(again.complete);
        assert!(again.all_stale());
    }

    #[test]
    fn repeated_entity_released_once() {
        let registry = registry();
        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddVolume, entity("v1"), None)
            .unwrap();
        registry
            .append_action(&mut op, Action::expand_volume(entity("v1"), 2))
            .unwrap();

        let report = CommitFinalizer::new(&registry).commit(&op).unwrap();
        assert_eq!(report.applied_count(), 1);
        assert!(matches!(report.steps[1].outcome, ActionOutcome::Skipped));
    }

    #[test]
    fn marker_taken_over_is_stale() {
        let registry = registry();
        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddBrick, entity("b1"), None)
            .unwrap();
        // Someone released the marker and a new operation took the brick.
        registry.locks().release(&op.id, &entity("b1")).unwrap();
        let mut other = registry.create(OperationKind::BrickEvict).unwrap();
        registry
            .record_preimage(&other.id, &EntitySnapshot::new(EntityKind::Brick, entity("b1")))
            .unwrap();
        registry
            .append(&mut other, ChangeKind::DeleteBrick, entity("b1"), None)
            .unwrap();

        let report = CommitFinalizer::new(&registry).commit(&op).unwrap();
        assert!(report.complete);
        assert_eq!(report.stale_count(), 1);
        assert_eq!(registry.owner(&entity("b1")).unwrap().unwrap().op_id, other.id);
    }

    #[test]
    fn commits_pending_children() {
        let registry = registry();
        let mut parent = registry.create(OperationKind::CloneVolume).unwrap();
        let mut child = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut child, ChangeKind::AddVolume, entity("v-child"), None)
            .unwrap();
        registry
            .append_action(&mut parent, Action::child_link(&child.id))
            .unwrap();

        let report = CommitFinalizer::new(&registry).commit(&parent).unwrap();
        assert!(report.complete, "{}", report.summary());
        assert_eq!(report.children.len(), 1);
        assert!(registry.try_load(&child.id).unwrap().is_none());
        assert!(registry.owner(&entity("v-child")).unwrap().is_none());
    }

    #[test]
    fn drops_preimages() {
        let registry = registry();
        let mut op = registry.create(OperationKind::DeleteVolume).unwrap();
        registry
            .record_preimage(&op.id, &EntitySnapshot::new(EntityKind::Volume, entity("v1")))
            .unwrap();
        registry
            .append(&mut op, ChangeKind::DeleteVolume, entity("v1"), None)
            .unwrap();
        CommitFinalizer::new(&registry).commit(&op).unwrap();
        assert!(registry.preimages().unwrap().is_empty());
    }

    #[test]
    fn refuses_partially_rolled_back_record() {
        let registry = registry();
        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddBrick, entity("b1"), None)
            .unwrap();
        let mut stored = registry.load(&op.id).unwrap();
        stored.advance_undone();
        registry.save(&mut stored).unwrap();

        let err = CommitFinalizer::new(&registry).commit(&op).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAction(_)));
        assert!(registry.try_load(&op.id).unwrap().is_some());
    }

    #[test]
    fn missing_record_reports_every_action_stale() {
        let registry = registry();
        let mut op = PendingOperation::new(OperationKind::ExpandVolume);
        op.push(Action::expand_volume(entity("v1"), 1));
        op.push(Action::child_link(&OpId::new()));
        let report = CommitFinalizer::new(&registry).commit(&op).unwrap();
        assert_eq!(report.stale_count(), 2);
    }
}
