//! core::ops::pending
//!
//! The pending-operation record and its action log.
//!
//! # Architecture
//!
//! A [`PendingOperation`] is the durable record of one in-flight workflow.
//! Its actions are kept in append order, which is the order the workflow
//! applied them; rollback walks them in reverse.
//!
//! This module only manages the in-memory record. Persistence, entity
//! enrollment, and payload/link checks happen in
//! [`Registry`](crate::engine::registry::Registry), which is the only
//! production path that appends to a persisted record.
//!
//! # Rollback Cursor
//!
//! `undone` counts trailing actions whose inverse has already been
//! applied. An interrupted rollback persists the cursor after each step, so
//! a re-invoked rollback resumes at the first action that has not been
//! undone instead of applying an inverse twice.
//!
//! A size reversal is absolute: the target size is computed once, stored
//! in `undo_target` before the entity is touched, and reused by every
//! retry of that step. Advancing the cursor clears it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use opledger::core::kinds::{ChangeKind, OperationKind};
//! use opledger::core::types::EntityId;
//! use opledger::engine::Registry;
//! use opledger::store::MemoryStore;
//!
//! let registry = Registry::new(Arc::new(MemoryStore::new()));
//! let mut op = registry.create(OperationKind::CreateVolume).unwrap();
//! registry.append(&mut op, ChangeKind::AddBrick, EntityId::new("brick-1").unwrap(), None).unwrap();
//! registry.append(&mut op, ChangeKind::AddVolume, EntityId::new("vol-2").unwrap(), None).unwrap();
//!
//! let order: Vec<_> = op.rollback_order().map(|a| a.entity_id().as_str()).collect();
//! assert_eq!(order, vec!["vol-2", "brick-1"]);
//! ```

use serde::{Deserialize, Serialize};

use crate::core::delta::Action;
use crate::core::kinds::{ChangeKind, EntityKind, OperationKind};
use crate::core::types::{EntityId, OpId, Revision, UtcTimestamp};

/// Durable record of one in-flight high-level workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique operation identifier.
    pub id: OpId,
    /// When the operation was created.
    pub created_at: UtcTimestamp,
    /// The workflow being tracked.
    pub kind: OperationKind,
    /// Recorded actions, in application order.
    actions: Vec<Action>,
    /// Number of trailing actions already undone by a rollback.
    #[serde(default, skip_serializing_if = "is_zero")]
    undone: usize,
    /// Absolute size the next size reversal restores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    undo_target: Option<u64>,
    /// Store revision this copy was read at.
    #[serde(skip)]
    revision: Option<Revision>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl PendingOperation {
    /// Create a new, empty record with a fresh id.
    pub fn new(kind: OperationKind) -> Self {
        Self {
            id: OpId::new(),
            created_at: UtcTimestamp::now(),
            kind,
            actions: vec![],
            undone: 0,
            undo_target: None,
            revision: None,
        }
    }

    /// Recorded actions in application order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Whether no action has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Append an action (in memory only).
    ///
    /// Persisted records gain actions only through the registry, which
    /// enrolls the entity first.
    pub(crate) fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Remove the most recently appended action.
    ///
    /// Used to undo an in-memory append whose persistence failed.
    pub(crate) fn pop(&mut self) -> Option<Action> {
        if self.actions.len() > self.undone {
            self.actions.pop()
        } else {
            None
        }
    }

    /// Store revision this copy was read at, if it has been persisted.
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: Option<Revision>) {
        self.revision = revision;
    }

    /// Number of trailing actions already undone by a rollback.
    pub fn undone(&self) -> usize {
        self.undone
    }

    /// Mark one more trailing action as undone.
    pub(crate) fn advance_undone(&mut self) {
        if self.undone < self.actions.len() {
            self.undone += 1;
        }
        self.undo_target = None;
    }

    /// Size the in-progress size reversal restores, once computed.
    pub fn undo_target(&self) -> Option<u64> {
        self.undo_target
    }

    pub(crate) fn set_undo_target(&mut self, size: u64) {
        self.undo_target = Some(size);
    }

    /// Whether a rollback has started on this record.
    pub fn rollback_started(&self) -> bool {
        self.undone > 0
    }

    /// Actions still to be undone, most recent first.
    pub fn rollback_order(&self) -> impl Iterator<Item = &Action> {
        let end = self.actions.len() - self.undone.min(self.actions.len());
        self.actions[..end].iter().rev()
    }

    /// Actions whose inverse has already been applied, most recent first.
    pub fn undone_actions(&self) -> impl Iterator<Item = &Action> {
        let start = self.actions.len() - self.undone.min(self.actions.len());
        self.actions[start..].iter().rev()
    }

    /// Entities named by entity-bearing actions, in append order.
    ///
    /// An entity named by several actions is yielded once.
    pub fn entities(&self) -> Vec<(EntityKind, &EntityId)> {
        let mut seen = std::collections::HashSet::new();
        self.actions
            .iter()
            .filter_map(|a| a.change().entity_kind().map(|k| (k, a.entity_id())))
            .filter(|(_, id)| seen.insert(*id))
            .collect()
    }

    /// Whether any action names `entity`.
    pub fn names_entity(&self, entity: &EntityId) -> bool {
        self.actions
            .iter()
            .any(|a| a.change().entity_kind().is_some() && a.entity_id() == entity)
    }

    /// Child operations linked from this record, in append order.
    pub fn children(&self) -> impl Iterator<Item = &OpId> {
        self.actions.iter().filter_map(|a| a.child_operation().ok())
    }

    /// Parent operations this record declares, in append order.
    pub fn parents(&self) -> impl Iterator<Item = &OpId> {
        self.actions.iter().filter_map(|a| a.parent_operation().ok())
    }

    /// How long the operation has been live at `now`.
    pub fn age_at(&self, now: &UtcTimestamp) -> chrono::Duration {
        self.created_at.age_at(now)
    }

    /// Preview what a rollback of the remaining actions would do.
    pub fn rollback_summary(&self) -> RollbackSummary {
        let mut summary = RollbackSummary::default();
        for action in self.rollback_order() {
            let id = action.entity_id().clone();
            match action.change() {
                c if c.creates_entity() => summary.removals.push(id),
                c if c.deletes_entity() => summary.restores.push(id),
                ChangeKind::ExpandVolume | ChangeKind::ExpandBlockVolume => {
                    summary.resizes.push(id)
                }
                ChangeKind::RemoveDevice => summary.reattaches.push(id),
                ChangeKind::ChildOperation => {
                    if let Some(child) = action.linked_operation() {
                        summary.children.push(child.clone());
                    }
                }
                _ => {}
            }
        }
        summary
    }
}

/// Summary of what a rollback would do, in walk order per category.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    /// Created entities that would be removed.
    pub removals: Vec<EntityId>,
    /// Deleted entities that would be re-created from pre-images.
    pub restores: Vec<EntityId>,
    /// Expanded entities that would be shrunk back.
    pub resizes: Vec<EntityId>,
    /// Removed devices that would be re-attached.
    pub reattaches: Vec<EntityId>,
    /// Child operations that would be unwound.
    pub children: Vec<OpId>,
}

impl RollbackSummary {
    /// Total number of inverse steps.
    pub fn total_items(&self) -> usize {
        self.removals.len()
            + self.restores.len()
            + self.resizes.len()
            + self.reattaches.len()
            + self.children.len()
    }
}
