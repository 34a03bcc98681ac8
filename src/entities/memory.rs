//! entities::memory
//!
//! In-memory entity store for deterministic testing.
//!
//! # Design
//!
//! `MemoryEntities` keeps one map of live entities and records every call
//! it receives, so tests can assert both the resulting state and the order
//! in which rollback applied its inverses. A single call can be configured
//! to fail, which lets tests drive the rollback engine's failure paths.
//!
//! # Example
//!
//! ```
//! use opledger::core::kinds::EntityKind;
//! use opledger::core::types::EntityId;
//! use opledger::entities::{EntityStore, MemoryEntities};
//!
//! let vol = EntityId::new("vol-1").unwrap();
//! let entities = MemoryEntities::new().with_entity(EntityKind::Volume, vol.clone(), Some(10));
//!
//! entities.set_size(EntityKind::Volume, &vol, 6).unwrap();
//! assert_eq!(entities.size(EntityKind::Volume, &vol).unwrap(), 6);
//!
//! entities.remove(EntityKind::Volume, &vol).unwrap();
//! assert!(!entities.exists(EntityKind::Volume, &vol).unwrap());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{EntityError, EntitySnapshot, EntityStore};
use crate::core::kinds::EntityKind;
use crate::core::types::EntityId;

/// In-memory entity store.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryEntities {
    inner: Arc<Mutex<MemoryEntitiesInner>>,
}

#[derive(Debug, Default)]
struct MemoryEntitiesInner {
    /// Live entities by id.
    entities: BTreeMap<EntityId, EntitySnapshot>,
    /// Devices that are currently detached.
    detached: BTreeSet<EntityId>,
    /// Call to fail, if any.
    fail_on: Option<FailOn>,
    /// Recorded calls.
    operations: Vec<EntityOperation>,
}

/// Which call should fail, and for which entity.
#[derive(Debug, Clone)]
pub enum FailOn {
    /// Fail `remove` for the entity.
    Remove(EntityId),
    /// Fail `restore` for the entity.
    Restore(EntityId),
    /// Fail `set_size` for the entity.
    SetSize(EntityId),
    /// Fail `reattach_device` for the device.
    Reattach(EntityId),
}

impl FailOn {
    fn matches(&self, op: &EntityOperation) -> bool {
        match (self, op) {
            (FailOn::Remove(a), EntityOperation::Remove { id, .. }) => a == id,
            (FailOn::Restore(a), EntityOperation::Restore { id, .. }) => a == id,
            (FailOn::SetSize(a), EntityOperation::SetSize { id, .. }) => a == id,
            (FailOn::Reattach(a), EntityOperation::Reattach { id }) => a == id,
            _ => false,
        }
    }
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityOperation {
    Remove { kind: EntityKind, id: EntityId },
    Restore { kind: EntityKind, id: EntityId },
    SetSize { kind: EntityKind, id: EntityId, size: u64 },
    Reattach { id: EntityId },
}

impl EntityOperation {
    /// The entity the call targeted.
    pub fn entity_id(&self) -> &EntityId {
        match self {
            EntityOperation::Remove { id, .. }
            | EntityOperation::Restore { id, .. }
            | EntityOperation::SetSize { id, .. }
            | EntityOperation::Reattach { id } => id,
        }
    }
}

impl MemoryEntities {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live entity.
    pub fn with_entity(self, kind: EntityKind, id: EntityId, size: Option<u64>) -> Self {
        self.insert(kind, id, size);
        self
    }

    /// Add a detached device.
    pub fn with_detached_device(self, id: EntityId) -> Self {
        self.state().detached.insert(id);
        self
    }

    /// Configure one call to fail with a backend error.
    pub fn fail_on(self, fail_on: FailOn) -> Self {
        self.state().fail_on = Some(fail_on);
        self
    }

    /// Clear the failure configuration.
    pub fn clear_fail_on(&self) {
        self.state().fail_on = None;
    }

    /// Insert (or replace) a live entity.
    pub fn insert(&self, kind: EntityKind, id: EntityId, size: Option<u64>) {
        let mut snapshot = EntitySnapshot::new(kind, id.clone());
        snapshot.size = size;
        self.state().entities.insert(id, snapshot);
    }

    /// Remove an entity without recording a call.
    pub fn discard(&self, id: &EntityId) {
        self.state().entities.remove(id);
    }

    /// Detach a device without recording a call.
    pub fn detach(&self, id: EntityId) {
        self.state().detached.insert(id);
    }

    /// Current snapshot of an entity.
    pub fn get(&self, id: &EntityId) -> Option<EntitySnapshot> {
        self.state().entities.get(id).cloned()
    }

    /// Current size of an entity.
    pub fn size_of(&self, id: &EntityId) -> Option<u64> {
        self.state().entities.get(id).and_then(|e| e.size)
    }

    /// Whether a device is detached.
    pub fn is_detached(&self, id: &EntityId) -> bool {
        self.state().detached.contains(id)
    }

    /// All recorded calls, in order.
    pub fn operations(&self) -> Vec<EntityOperation> {
        self.state().operations.clone()
    }

    /// Forget recorded calls.
    pub fn clear_operations(&self) {
        self.state().operations.clear();
    }

    fn state(&self) -> MutexGuard<'_, MemoryEntitiesInner> {
        // A panicking test thread must not wedge the others.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call and decide whether it should fail.
    fn record(inner: &mut MemoryEntitiesInner, op: EntityOperation) -> Result<(), EntityError> {
        let fail = inner.fail_on.as_ref().is_some_and(|f| f.matches(&op));
        let id = op.entity_id().clone();
        inner.operations.push(op);
        if fail {
            Err(EntityError::Backend(format!("injected failure for {}", id)))
        } else {
            Ok(())
        }
    }

    fn live_mut<'a>(
        inner: &'a mut MemoryEntitiesInner,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<&'a mut EntitySnapshot, EntityError> {
        match inner.entities.get_mut(id) {
            Some(e) if e.kind == kind => Ok(e),
            _ => Err(EntityError::NotFound {
                kind,
                id: id.clone(),
            }),
        }
    }
}

impl EntityStore for MemoryEntities {
    fn remove(&self, kind: EntityKind, id: &EntityId) -> Result<(), EntityError> {
        let mut inner = self.state();
        Self::record(
            &mut inner,
            EntityOperation::Remove {
                kind,
                id: id.clone(),
            },
        )?;
        Self::live_mut(&mut inner, kind, id)?;
        inner.entities.remove(id);
        Ok(())
    }

    fn restore(&self, snapshot: &EntitySnapshot) -> Result<(), EntityError> {
        let mut inner = self.state();
        Self::record(
            &mut inner,
            EntityOperation::Restore {
                kind: snapshot.kind,
                id: snapshot.id.clone(),
            },
        )?;
        if inner.entities.contains_key(&snapshot.id) {
            return Err(EntityError::AlreadyExists {
                kind: snapshot.kind,
                id: snapshot.id.clone(),
            });
        }
        inner
            .entities
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    fn size(&self, kind: EntityKind, id: &EntityId) -> Result<u64, EntityError> {
        let mut inner = self.state();
        Ok(Self::live_mut(&mut inner, kind, id)?.size.unwrap_or(0))
    }

    fn set_size(&self, kind: EntityKind, id: &EntityId, size: u64) -> Result<(), EntityError> {
        let mut inner = self.state();
        Self::record(
            &mut inner,
            EntityOperation::SetSize {
                kind,
                id: id.clone(),
                size,
            },
        )?;
        Self::live_mut(&mut inner, kind, id)?.size = Some(size);
        Ok(())
    }

    fn reattach_device(&self, id: &EntityId) -> Result<(), EntityError> {
        let mut inner = self.state();
        Self::record(&mut inner, EntityOperation::Reattach { id: id.clone() })?;
        if !inner.detached.remove(id) {
            return Err(EntityError::AlreadyAttached(id.clone()));
        }
        Ok(())
    }

    fn exists(&self, kind: EntityKind, id: &EntityId) -> Result<bool, EntityError> {
        let inner = self.state();
        Ok(match kind {
            EntityKind::Device => inner.entities.contains_key(id) || inner.detached.contains(id),
            _ => inner.entities.get(id).is_some_and(|e| e.kind == kind),
        })
    }
}
