//! engine::rollback
//!
//! Undo a pending operation by applying the inverse of each recorded
//! action in reverse order.
//!
//! # Inverses
//!
//! | Change | Inverse |
//! |--------|---------|
//! | add brick / volume / block volume, clone, snapshot | remove the entity |
//! | delete brick / volume / block volume | restore from the pre-image |
//! | expand volume | set the size computed before the first attempt |
//! | expand block volume | set the size from the pre-image |
//! | remove device | re-attach the device |
//! | child operation | roll the child back fully first |
//! | parent operation | none |
//!
//! # Resumption
//!
//! After each inverse the record's rollback cursor is advanced and saved.
//! A re-invoked rollback reloads the record and resumes at the first action
//! not yet undone. Once the walk completes, the operation's pending markers
//! are released, its pre-images dropped, and the record deleted; a rollback
//! invoked after that reports every action as stale and touches nothing.
//!
//! An inverse that has already taken effect (entity already gone, already
//! restored, device already attached) is reported as stale and the walk
//! continues. Any other failure stops the walk and leaves the record and
//! its markers in place for a later retry.
//!
//! The cursor is saved after the inverse is applied, so a crash between the
//! two re-applies that one inverse on retry. Removal, restore, and re-attach
//! absorb this as a stale step. An expansion is undone by setting an
//! absolute size: the current size minus the recorded delta is computed
//! once and saved on the record before the volume is touched, and every
//! retry of that step sets the same size.

use tracing::{debug, info, warn};

use super::error::{LedgerError, Result};
use super::registry::Registry;
use super::report::{ActionOutcome, FinalizeReport, Outcome};
use crate::core::delta::Action;
use crate::core::kinds::{ChangeKind, EntityKind};
use crate::core::ops::PendingOperation;
use crate::core::types::OpId;
use crate::entities::{EntityError, EntitySnapshot, EntityStore};

/// Applies inverses through an entity store.
pub struct RollbackEngine<'a> {
    registry: &'a Registry,
    entities: &'a dyn EntityStore,
}

impl<'a> RollbackEngine<'a> {
    /// Create an engine over a registry and entity store.
    pub fn new(registry: &'a Registry, entities: &'a dyn EntityStore) -> Self {
        Self { registry, entities }
    }

    /// Roll back `op`.
    ///
    /// The persisted record is reloaded first; `op` only supplies the
    /// actions to report when the record is already gone.
    ///
    /// # Errors
    ///
    /// Only a failure to load the record is returned as an error. Failures
    /// during the walk are recorded in the report, which is then marked
    /// incomplete.
    pub fn rollback(&self, op: &PendingOperation) -> Result<FinalizeReport> {
        self.rollback_at(op, 0)
    }

    /// Load and roll back the operation `id`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if no record exists.
    pub fn rollback_id(&self, id: &OpId) -> Result<FinalizeReport> {
        let op = self.registry.load(id)?;
        self.rollback(&op)
    }

    fn rollback_at(&self, op: &PendingOperation, depth: usize) -> Result<FinalizeReport> {
        let mut report = FinalizeReport::new(op.id.clone(), Outcome::Rollback);

        let Some(mut current) = self.registry.try_load(&op.id)? else {
            debug!(op = %op.id, "record already gone, nothing to roll back");
            for action in op.actions().iter().rev() {
                report.record_stale(action.clone(), already_finalized(&op.id, action));
            }
            return Ok(report);
        };

        debug!(
            op = %current.id,
            kind = %current.kind,
            resume_at = current.undone(),
            total = current.len(),
            "rolling back"
        );

        let remaining: Vec<Action> = current.rollback_order().cloned().collect();
        for action in remaining {
            match self.invert(&mut current, &action, depth, &mut report) {
                ActionOutcome::Failed(err) => {
                    warn!(op = %current.id, action = %action.describe(), error = %err, "inverse failed");
                    report.record_failure(action, err);
                    return Ok(report);
                }
                ActionOutcome::Stale(err) => {
                    warn!(op = %current.id, error = %err, "stale action during rollback");
                    report.record_stale(action, err);
                }
                ActionOutcome::Applied => report.record_applied(action),
                ActionOutcome::Skipped => report.record_skipped(action),
            }

            current.advance_undone();
            if let Err(err) = self.registry.save(&mut current) {
                warn!(op = %current.id, error = %err, "could not persist rollback progress");
                report.halt(err);
                return Ok(report);
            }
        }

        if let Err(err) = self.retire(&current) {
            warn!(op = %current.id, error = %err, "could not retire rolled-back operation");
            report.halt(err);
            return Ok(report);
        }

        info!(
            op = %current.id,
            applied = report.applied_count(),
            stale = report.stale_count(),
            "rolled back"
        );
        Ok(report)
    }

    /// Apply the inverse of one action.
    fn invert(
        &self,
        op: &mut PendingOperation,
        action: &Action,
        depth: usize,
        report: &mut FinalizeReport,
    ) -> ActionOutcome {
        let change = action.change();
        if change == ChangeKind::ChildOperation {
            return self.invert_child(op, action, depth, report);
        }
        let Some(kind) = change.entity_kind() else {
            return ActionOutcome::Skipped;
        };
        let id = action.entity_id();

        let result: std::result::Result<(), EntityError> = if change.creates_entity() {
            self.entities.remove(kind, id)
        } else if change.deletes_entity() {
            match self.preimage(op, action) {
                Ok(snapshot) => self.entities.restore(&snapshot),
                Err(err) => return ActionOutcome::Failed(err),
            }
        } else {
            match change {
                ChangeKind::ExpandVolume => match self.shrink_target(op, kind, action) {
                    Ok(size) => self.entities.set_size(kind, id, size),
                    Err(LedgerError::Entity(err)) => Err(err),
                    Err(err) => return ActionOutcome::Failed(err),
                },
                ChangeKind::ExpandBlockVolume => {
                    let size = match self.preimage(op, action) {
                        Ok(EntitySnapshot { size: Some(size), .. }) => size,
                        Ok(_) => {
                            return ActionOutcome::Failed(LedgerError::InvalidAction(format!(
                                "pre-image of {} has no size",
                                id
                            )))
                        }
                        Err(err) => return ActionOutcome::Failed(err),
                    };
                    self.entities.set_size(kind, id, size)
                }
                ChangeKind::RemoveDevice => self.entities.reattach_device(id),
                _ => return ActionOutcome::Skipped,
            }
        };

        match result {
            Ok(()) => {
                debug!(op = %op.id, action = %action.describe(), "applied inverse");
                ActionOutcome::Applied
            }
            Err(err) if err.is_already_applied() => ActionOutcome::Stale(LedgerError::StaleAction {
                op: op.id.clone(),
                action: action.describe(),
                reason: err.to_string(),
            }),
            Err(err) => ActionOutcome::Failed(err.into()),
        }
    }

    /// Roll back a linked child operation.
    fn invert_child(
        &self,
        op: &PendingOperation,
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
            Ok(None) => return ActionOutcome::Stale(already_finalized(&op.id, action)),
            Err(err) => return ActionOutcome::Failed(err),
        };
        match self.rollback_at(&child, depth + 1) {
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

    /// Size an expanded volume returns to, fixed on the record before the
    /// volume is resized.
    fn shrink_target(
        &self,
        op: &mut PendingOperation,
        kind: EntityKind,
        action: &Action,
    ) -> Result<u64> {
        if let Some(size) = op.undo_target() {
            return Ok(size);
        }
        let by = action.expand_size()?;
        let id = action.entity_id();
        let size = self.entities.size(kind, id)?;
        let target = size.checked_sub(by).ok_or_else(|| EntityError::SizeUnderflow {
            kind,
            id: id.clone(),
            size,
            by,
        })?;
        op.set_undo_target(target);
        self.registry.save(op)?;
        debug!(op = %op.id, entity = %id, size = target, "fixed shrink target");
        Ok(target)
    }

    fn preimage(
        &self,
        op: &PendingOperation,
        action: &Action,
    ) -> std::result::Result<EntitySnapshot, LedgerError> {
        self.registry
            .preimage(&op.id, action.entity_id())?
            .ok_or_else(|| LedgerError::MissingPreimage {
                op: op.id.clone(),
                entity: action.entity_id().clone(),
            })
    }

    /// Release markers, drop pre-images, delete the record.
    fn retire(&self, op: &PendingOperation) -> Result<()> {
        let released = self.registry.release_markers(op)?;
        let dropped = self.registry.drop_preimages(&op.id)?;
        self.registry.delete_record(op)?;
        debug!(
            op = %op.id,
            released = released.len(),
            preimages = dropped,
            "retired operation"
        );
        Ok(())
    }
}

fn already_finalized(op: &OpId, action: &Action) -> LedgerError {
    LedgerError::StaleAction {
        op: op.clone(),
        action: action.describe(),
        reason: "operation already finalized".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kinds::OperationKind;
    use crate::core::types::EntityId;
    use crate::entities::memory::{EntityOperation, FailOn};
    use crate::entities::MemoryEntities;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn entity(id: &str) -> EntityId {
        EntityId::new(id).unwrap()
    }

    fn setup() -> (Registry, MemoryEntities) {
        (Registry::new(Arc::new(MemoryStore::new())), MemoryEntities::new())
    }

    fn touched(entities: &MemoryEntities) -> Vec<String> {
        entities
            .operations()
            .iter()
            .map(|op| op.entity_id().to_string())
            .collect()
    }

    mod order {
        use super::*;

        #[test]
        fn create_volume_undone_in_reverse() {
            let (registry, entities) = setup();
            entities.insert(EntityKind::Brick, entity("brick-1"), None);
            entities.insert(EntityKind::Volume, entity("vol-2"), Some(10));

            let mut op = registry.create(OperationKind::CreateVolume).unwrap();
            registry
                .append(&mut op, ChangeKind::AddBrick, entity("brick-1"), None)
                .unwrap();
            registry
                .append(&mut op, ChangeKind::AddVolume, entity("vol-2"), None)
                .unwrap();

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(report.complete, "{}", report.summary());
            assert_eq!(report.applied_count(), 2);
            assert_eq!(touched(&entities), vec!["vol-2", "brick-1"]);
            assert!(entities.get(&entity("vol-2")).is_none());
            assert!(entities.get(&entity("brick-1")).is_none());

            assert!(matches!(registry.load(&op.id), Err(LedgerError::NotFound(_))));
            assert!(registry.owner(&entity("brick-1")).unwrap().is_none());
            assert!(registry.owner(&entity("vol-2")).unwrap().is_none());
        }

        #[test]
        fn child_is_unwound_before_earlier_parent_actions() {
            let (registry, entities) = setup();
            entities.insert(EntityKind::Brick, entity("b-parent"), None);
            entities.insert(EntityKind::Volume, entity("v-child"), None);

            let mut parent = registry.create(OperationKind::CloneVolume).unwrap();
            let mut child = registry.create(OperationKind::CreateVolume).unwrap();
            registry
                .append(&mut parent, ChangeKind::AddBrick, entity("b-parent"), None)
                .unwrap();
            registry
                .append_action(&mut parent, Action::child_link(&child.id))
                .unwrap();
            registry
                .append_action(&mut child, Action::parent_link(&parent.id))
                .unwrap();
            registry
                .append(&mut child, ChangeKind::AddVolume, entity("v-child"), None)
                .unwrap();

            let report = RollbackEngine::new(&registry, &entities)
                .rollback(&parent)
                .unwrap();
            assert!(report.complete, "{}", report.summary());
            assert_eq!(touched(&entities), vec!["v-child", "b-parent"]);
            assert_eq!(report.children.len(), 1);
            assert!(registry.try_load(&child.id).unwrap().is_none());
            assert!(registry.owner(&entity("v-child")).unwrap().is_none());
        }
    }

    mod inverses {
        use super::*;

        #[test]
        fn expand_volume_returns_to_prior_size() {
            let (registry, entities) = setup();
            entities.insert(EntityKind::Volume, entity("vol-1"), Some(15));
            let mut op = registry.create(OperationKind::ExpandVolume).unwrap();
            registry
                .append_action(&mut op, Action::expand_volume(entity("vol-1"), 5))
                .unwrap();

            RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert_eq!(entities.size_of(&entity("vol-1")), Some(10));
        }

        #[test]
        fn delete_restores_preimage() {
            let (registry, entities) = setup();
            let mut op = registry.create(OperationKind::DeleteVolume).unwrap();
            let snapshot = EntitySnapshot::new(EntityKind::Volume, entity("vol-1"))
                .with_size(42)
                .with_attribute("cluster", serde_json::json!("c1"));
            registry.record_preimage(&op.id, &snapshot).unwrap();
            registry
                .append(&mut op, ChangeKind::DeleteVolume, entity("vol-1"), None)
                .unwrap();

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(report.complete);
            assert_eq!(entities.get(&entity("vol-1")), Some(snapshot));
            assert!(registry.preimages().unwrap().is_empty());
        }

        #[test]
        fn expand_block_volume_sets_preimage_size() {
            let (registry, entities) = setup();
            entities.insert(EntityKind::BlockVolume, entity("bv-1"), Some(30));
            let mut op = registry.create(OperationKind::ExpandBlockVolume).unwrap();
            registry
                .record_preimage(
                    &op.id,
                    &EntitySnapshot::new(EntityKind::BlockVolume, entity("bv-1")).with_size(20),
                )
                .unwrap();
            registry
                .append(&mut op, ChangeKind::ExpandBlockVolume, entity("bv-1"), None)
                .unwrap();

            RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert_eq!(entities.size_of(&entity("bv-1")), Some(20));
        }

        #[test]
        fn remove_device_reattaches() {
            let (registry, entities) = setup();
            entities.detach(entity("dev-1"));
            let mut op = registry.create(OperationKind::RemoveDevice).unwrap();
            registry
                .append(&mut op, ChangeKind::RemoveDevice, entity("dev-1"), None)
                .unwrap();

            RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(!entities.is_detached(&entity("dev-1")));
        }

        #[test]
        fn parent_link_has_no_inverse() {
            let (registry, entities) = setup();
            let parent = registry.create(OperationKind::CloneVolume).unwrap();
            let mut child = registry.create(OperationKind::CreateVolume).unwrap();
            registry
                .append_action(&mut child, Action::parent_link(&parent.id))
                .unwrap();

            let report = RollbackEngine::new(&registry, &entities)
                .rollback(&child)
                .unwrap();
            assert!(matches!(report.steps[0].outcome, ActionOutcome::Skipped));
            assert!(entities.operations().is_empty());
            assert!(registry.try_load(&parent.id).unwrap().is_some());
        }
    }

    mod idempotence {
        use super::*;

        #[test]
        fn second_rollback_is_all_stale() {
            let (registry, entities) = setup();
            entities.insert(EntityKind::Brick, entity("b1"), None);
            entities.insert(EntityKind::Volume, entity("v1"), Some(4));
            let mut op = registry.create(OperationKind::CreateVolume).unwrap();
            registry
                .append(&mut op, ChangeKind::AddBrick, entity("b1"), None)
                .unwrap();
            registry
                .append(&mut op, ChangeKind::AddVolume, entity("v1"), None)
                .unwrap();

            let engine = RollbackEngine::new(&registry, &entities);
            engine.rollback(&op).unwrap();
            let calls = entities.operations().len();

            let second = engine.rollback(&op).unwrap();
            assert!(second.complete);
            assert!(second.all_stale());
            assert_eq!(second.steps.len(), 2);
            assert_eq!(entities.operations().len(), calls);
        }

        #[test]
        fn already_absent_entity_is_stale_not_failure() {
            let (registry, entities) = setup();
            let mut op = registry.create(OperationKind::CreateVolume).unwrap();
            registry
                .append(&mut op, ChangeKind::AddBrick, entity("b1"), None)
                .unwrap();

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(report.complete);
            match &report.steps[0].outcome {
                ActionOutcome::Stale(err) => assert!(err.is_stale()),
                other => panic!("expected stale, got {:?}", other),
            }
            assert!(registry.try_load(&op.id).unwrap().is_none());
        }
    }

    mod failures {
        use super::*;

        fn three_bricks(registry: &Registry, entities: &MemoryEntities) -> PendingOperation {
            let mut op = registry.create(OperationKind::CreateVolume).unwrap();
            for name in ["b1", "b2", "b3"] {
                entities.insert(EntityKind::Brick, entity(name), None);
                registry
                    .append(&mut op, ChangeKind::AddBrick, entity(name), None)
                    .unwrap();
            }
            op
        }

        #[test]
        fn hard_failure_stops_and_keeps_record() {
            let (registry, entities) = setup();
            let op = three_bricks(&registry, &entities);
            let entities = entities.fail_on(FailOn::Remove(entity("b2")));

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(!report.complete);
            assert!(matches!(
                report.first_failure(),
                Some(LedgerError::Entity(EntityError::Backend(_)))
            ));
            assert_eq!(touched(&entities), vec!["b3", "b2"]);

            let stored = registry.load(&op.id).unwrap();
            assert_eq!(stored.undone(), 1);
            assert_eq!(registry.owner(&entity("b1")).unwrap().unwrap().op_id, op.id);
        }

        #[test]
        fn retry_resumes_after_failure() {
            let (registry, entities) = setup();
            let op = three_bricks(&registry, &entities);
            let entities = entities.fail_on(FailOn::Remove(entity("b2")));
            let engine = RollbackEngine::new(&registry, &entities);
            engine.rollback(&op).unwrap();

            entities.clear_fail_on();
            entities.clear_operations();
            let report = engine.rollback(&op).unwrap();
            assert!(report.complete, "{}", report.summary());
            assert_eq!(touched(&entities), vec!["b2", "b1"]);
            assert!(registry.try_load(&op.id).unwrap().is_none());
        }

        #[test]
        fn missing_preimage_is_a_failure() {
            let (registry, entities) = setup();
            let mut op = registry.create(OperationKind::DeleteVolume).unwrap();
            registry
                .record_preimage(&op.id, &EntitySnapshot::new(EntityKind::Volume, entity("v1")))
                .unwrap();
            registry
                .append(&mut op, ChangeKind::DeleteVolume, entity("v1"), None)
                .unwrap();
            registry.drop_preimages(&op.id).unwrap();

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(matches!(
                report.first_failure(),
                Some(LedgerError::MissingPreimage { .. })
            ));
        }

        #[test]
        fn crash_mid_walk_resumes_without_reapplying() {
            use crate::store::fault_injection;

            let (registry, entities) = setup();
            let op = three_bricks(&registry, &entities);

            // First cursor save succeeds, the second "crashes".
            fault_injection::set_crash_after(2);
            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            fault_injection::reset();
            assert!(!report.complete);
            assert!(report.halted.is_some());

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(report.complete, "{}", report.summary());

            let removes_of_b3 = entities
                .operations()
                .iter()
                .filter(|o| matches!(o, EntityOperation::Remove { id, .. } if id.as_str() == "b3"))
                .count();
            assert_eq!(removes_of_b3, 1);
            assert!(registry.try_load(&op.id).unwrap().is_none());
        }

        fn expanded_volume(registry: &Registry, entities: &MemoryEntities) -> PendingOperation {
            entities.insert(EntityKind::Volume, entity("vol-1"), Some(15));
            let mut op = registry.create(OperationKind::ExpandVolume).unwrap();
            registry
                .append_action(&mut op, Action::expand_volume(entity("vol-1"), 5))
                .unwrap();
            op
        }

        #[test]
        fn crash_before_shrink_target_is_saved() {
            use crate::store::fault_injection;

            let (registry, entities) = setup();
            let op = expanded_volume(&registry, &entities);

            fault_injection::set_crash_after(1);
            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            fault_injection::reset();
            assert!(!report.complete);
            assert_eq!(entities.size_of(&entity("vol-1")), Some(15));

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(report.complete, "{}", report.summary());
            assert_eq!(entities.size_of(&entity("vol-1")), Some(10));
        }

        #[test]
        fn crash_after_resize_does_not_shrink_twice() {
            use crate::store::fault_injection;

            let (registry, entities) = setup();
            let op = expanded_volume(&registry, &entities);

            // The target save and the resize succeed, then the cursor save fails.
            fault_injection::set_crash_after(2);
            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            fault_injection::reset();
            assert!(report.halted.is_some());
            assert_eq!(entities.size_of(&entity("vol-1")), Some(10));
            assert_eq!(registry.load(&op.id).unwrap().undo_target(), Some(10));

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(report.complete, "{}", report.summary());
            assert_eq!(entities.size_of(&entity("vol-1")), Some(10));
            assert!(registry.try_load(&op.id).unwrap().is_none());
        }

        #[test]
        fn failed_resize_retries_with_the_same_target() {
            let (registry, entities) = setup();
            let op = expanded_volume(&registry, &entities);
            let entities = entities.fail_on(FailOn::SetSize(entity("vol-1")));
            let engine = RollbackEngine::new(&registry, &entities);
            assert!(!engine.rollback(&op).unwrap().complete);

            // The retry sets the saved size even if the volume moved meanwhile.
            entities.clear_fail_on();
            entities.set_size(EntityKind::Volume, &entity("vol-1"), 40).unwrap();
            assert!(engine.rollback(&op).unwrap().complete);
            assert_eq!(entities.size_of(&entity("vol-1")), Some(10));
        }

        #[test]
        fn shrink_below_zero_is_a_failure() {
            let (registry, entities) = setup();
            entities.insert(EntityKind::Volume, entity("vol-1"), Some(3));
            let mut op = registry.create(OperationKind::ExpandVolume).unwrap();
            registry
                .append_action(&mut op, Action::expand_volume(entity("vol-1"), 5))
                .unwrap();

            let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
            assert!(matches!(
                report.first_failure(),
                Some(LedgerError::Entity(EntityError::SizeUnderflow { .. }))
            ));
            assert_eq!(entities.size_of(&entity("vol-1")), Some(3));
            assert_eq!(registry.load(&op.id).unwrap().undo_target(), None);
        }
    }
}
