//! engine::registry
//!
//! The operation registry: persistence of pending-operation records,
//! entity enrollment, and pre-images.
//!
//! # Architecture
//!
//! The registry is the only production path that writes ledger records.
//! Every write is a compare-and-swap against the revision the caller read,
//! so two copies of the same record can never silently overwrite each
//! other.
//!
//! # Appending
//!
//! [`Registry::append_action`] runs its checks before writing anything:
//!
//! 1. Unknown changes and records under rollback are refused
//! 2. Operation links must name an existing record, must not close a
//!    cycle, and must stay within the link depth limit
//! 3. Destructive changes need a recorded pre-image
//! 4. The named entity is enrolled under the operation
//!
//! Only then is the action appended and the record saved. If the save
//! fails, the in-memory append is undone and a marker taken by this call is
//! released again.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use opledger::core::kinds::{ChangeKind, OperationKind};
//! use opledger::core::types::EntityId;
//! use opledger::engine::Registry;
//! use opledger::store::MemoryStore;
//!
//! let registry = Registry::new(Arc::new(MemoryStore::new()));
//! let mut op = registry.create(OperationKind::CreateVolume).unwrap();
//! registry
//!     .append(&mut op, ChangeKind::AddBrick, EntityId::new("brick-1").unwrap(), None)
//!     .unwrap();
//!
//! let loaded = registry.load(&op.id).unwrap();
//! assert_eq!(loaded, op);
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::{LedgerError, Result};
use super::links::LinkGraph;
use crate::core::config::LedgerConfig;
use crate::core::delta::{Action, Delta};
use crate::core::kinds::{ChangeKind, OperationKind};
use crate::core::ops::{EntityLocks, Enrollment, PendingMarker, PendingOperation, Release};
use crate::core::types::{EntityId, OpId};
use crate::entities::EntitySnapshot;
use crate::store::{
    op_key, preimage_key, preimage_prefix, KvStore, StoreError, OPS_PREFIX, PREIMAGE_PREFIX,
};

/// Registry of pending operations over a shared store.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
    max_cas_retries: u32,
    max_link_depth: usize,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("max_cas_retries", &self.max_cas_retries)
            .field("max_link_depth", &self.max_link_depth)
            .finish_non_exhaustive()
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|e| LedgerError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

impl Registry {
    /// Create a registry with default limits.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, &LedgerConfig::default())
    }

    /// Create a registry with limits taken from `config`.
    pub fn with_config(store: Arc<dyn KvStore>, config: &LedgerConfig) -> Self {
        Self {
            store,
            max_cas_retries: config.max_cas_retries.max(1),
            max_link_depth: config.max_link_depth.max(1),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    /// Maximum child-operation nesting.
    pub fn max_link_depth(&self) -> usize {
        self.max_link_depth
    }

    /// Attempts for retried read-modify-write loops.
    pub fn max_cas_retries(&self) -> u32 {
        self.max_cas_retries
    }

    /// Enrollment locks over this registry's store.
    pub fn locks(&self) -> EntityLocks<'_> {
        EntityLocks::new(self.store.as_ref(), self.max_cas_retries)
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Create and persist an empty record with a fresh id.
    pub fn create(&self, kind: OperationKind) -> Result<PendingOperation> {
        let mut op = PendingOperation::new(kind);
        self.save(&mut op)?;
        debug!(op = %op.id, kind = %kind, "created pending operation");
        Ok(op)
    }

    /// Load a record, or `None` if it does not exist.
    pub fn try_load(&self, id: &OpId) -> Result<Option<PendingOperation>> {
        let key = op_key(id);
        let Some(entry) = self.store.get(&key)? else {
            return Ok(None);
        };
        let mut op: PendingOperation = decode(&key, &entry.value)?;
        if op.id != *id {
            return Err(LedgerError::Corrupt {
                key,
                message: format!("record holds id {}", op.id),
            });
        }
        op.set_revision(Some(entry.revision));
        Ok(Some(op))
    }

    /// Load a record.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if no record exists.
    pub fn load(&self, id: &OpId) -> Result<PendingOperation> {
        self.try_load(id)?
            .ok_or_else(|| LedgerError::NotFound(id.clone()))
    }

    /// Persist `op` at the revision it was read at.
    ///
    /// A record that was never persisted is created; it must not exist yet.
    ///
    /// # Errors
    ///
    /// [`LedgerError::StorageConflict`] if the stored record changed (or
    /// vanished) since `op` was read. Reload and retry.
    pub fn save(&self, op: &mut PendingOperation) -> Result<()> {
        let key = op_key(&op.id);
        let value = serde_json::to_string(op)?;
        let revision = self.store.compare_and_swap(&key, op.revision(), &value)?;
        op.set_revision(Some(revision));
        Ok(())
    }

    /// Delete a record. Returns whether it existed.
    pub fn delete(&self, id: &OpId) -> Result<bool> {
        match self.store.delete(&op_key(id), None) {
            Ok(()) => {
                debug!(op = %id, "deleted pending operation");
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all persisted records, sorted.
    pub fn list(&self) -> Result<Vec<OpId>> {
        self.store
            .list(OPS_PREFIX)?
            .into_iter()
            .map(|key| {
                let raw = key.trim_start_matches(OPS_PREFIX).to_string();
                OpId::parse(raw).map_err(|e| LedgerError::Corrupt {
                    key,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    /// Load every persisted record.
    ///
    /// Records deleted between listing and loading are skipped.
    pub fn load_all(&self) -> Result<Vec<PendingOperation>> {
        let mut ops = Vec::new();
        for id in self.list()? {
            if let Some(op) = self.try_load(&id)? {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    /// Delete the record `op` was read from. Returns whether it existed.
    ///
    /// Unlike [`delete`](Self::delete) this is a compare-and-swap on the
    /// revision of `op`, so a record that changed since it was read is kept.
    ///
    /// # Errors
    ///
    /// [`LedgerError::StorageConflict`] if the stored record changed since
    /// `op` was read.
    pub fn delete_record(&self, op: &PendingOperation) -> Result<bool> {
        match self.store.delete(&op_key(&op.id), op.revision()) {
            Ok(()) => {
                debug!(op = %op.id, "deleted pending operation");
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Load, modify, and save a record, retrying lost races.
    ///
    /// `f` may run several times; it must be a pure function of the record.
    /// It may not change the recorded actions or the rollback cursor; those
    /// only move through [`append_action`](Self::append_action) and the
    /// finalizers.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if the record does not exist
    /// - [`LedgerError::InvalidAction`] if `f` changed the actions or cursor
    /// - [`LedgerError::Conflict`] if every attempt lost its race
    /// - any error returned by `f`
    pub fn update<F>(&self, id: &OpId, mut f: F) -> Result<PendingOperation>
    where
        F: FnMut(&mut PendingOperation) -> Result<()>,
    {
        for attempt in 1..=self.max_cas_retries {
            let mut op = self.load(id)?;
            let actions = op.actions().to_vec();
            let cursor = (op.undone(), op.undo_target());
            f(&mut op)?;
            if op.actions() != actions.as_slice() || (op.undone(), op.undo_target()) != cursor {
                return Err(LedgerError::InvalidAction(format!(
                    "update cannot change the recorded actions of {}",
                    id
                )));
            }
            match self.save(&mut op) {
                Ok(()) => return Ok(op),
                Err(e) if e.is_storage_conflict() => {
                    debug!(op = %id, attempt, "update lost race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(op = %id, attempts = self.max_cas_retries, "update kept losing races");
        Err(LedgerError::Conflict {
            subject: op_key(id),
            owner: None,
        })
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Build an action and append it. See [`append_action`](Self::append_action).
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidDelta`] if `delta` does not fit `change`, plus
    /// everything `append_action` returns.
    pub fn append(
        &self,
        op: &mut PendingOperation,
        change: ChangeKind,
        entity: EntityId,
        delta: Option<Delta>,
    ) -> Result<()> {
        let action = Action::new(change, entity, delta)?;
        self.append_action(op, action)
    }

    /// Check, enroll, append, and persist one action.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAction`] for `Unknown` changes or a record
    ///   that is being rolled back
    /// - [`LedgerError::NotFound`] if a linked operation does not exist
    /// - [`LedgerError::CycleDetected`] if a link would close a cycle
    /// - [`LedgerError::LinkDepthExceeded`] if a link nests too deep
    /// - [`LedgerError::MissingPreimage`] for destructive changes without one
    /// - [`LedgerError::Conflict`] if another operation holds the entity
    /// - [`LedgerError::StorageConflict`] if the record changed since read
    pub fn append_action(&self, op: &mut PendingOperation, action: Action) -> Result<()> {
        let change = action.change();
        if change == ChangeKind::Unknown {
            return Err(LedgerError::InvalidAction(format!(
                "cannot record '{}' change for {}",
                change,
                action.entity_id()
            )));
        }
        if op.rollback_started() {
            return Err(LedgerError::InvalidAction(format!(
                "operation {} is being rolled back",
                op.id
            )));
        }
        if change.is_link() {
            self.check_link(op, &action)?;
        }
        if change.requires_preimage() && self.preimage(&op.id, action.entity_id())?.is_none() {
            return Err(LedgerError::MissingPreimage {
                op: op.id.clone(),
                entity: action.entity_id().clone(),
            });
        }

        let acquired = match change.entity_kind() {
            Some(kind) => {
                self.locks().enroll(&op.id, kind, action.entity_id())? == Enrollment::Acquired
            }
            None => false,
        };

        let entity = action.entity_id().clone();
        let described = action.describe();
        op.push(action);
        if let Err(err) = self.save(op) {
            op.pop();
            if acquired {
                if let Err(release_err) = self.locks().release(&op.id, &entity) {
                    warn!(
                        op = %op.id,
                        entity = %entity,
                        error = %release_err,
                        "could not release marker after failed append"
                    );
                }
            }
            return Err(err);
        }
        debug!(op = %op.id, action = %described, "appended action");
        Ok(())
    }

    /// Reject links to missing records, cycles, and over-deep nesting.
    fn check_link(&self, op: &PendingOperation, action: &Action) -> Result<()> {
        let Some(target) = action.linked_operation() else {
            return Err(LedgerError::InvalidAction(format!(
                "'{}' without a linked operation",
                action.change()
            )));
        };
        if *target == op.id {
            return Err(LedgerError::CycleDetected {
                trace: vec![op.id.clone(), op.id.clone()],
            });
        }
        if self.try_load(target)?.is_none() {
            return Err(LedgerError::NotFound(target.clone()));
        }

        let mut graph = LinkGraph::from_operations(
            self.load_all()?.iter().filter(|other| other.id != op.id),
        );
        graph.extend(op);

        let (parent, child) = match action.change() {
            ChangeKind::ChildOperation => (&op.id, target),
            _ => (target, &op.id),
        };
        if let Some(path) = graph.path(child, parent) {
            let mut trace = vec![parent.clone()];
            trace.extend(path);
            return Err(LedgerError::CycleDetected { trace });
        }
        let depth = graph.depth_above(parent) + 1 + graph.height_below(child);
        if depth > self.max_link_depth {
            return Err(LedgerError::LinkDepthExceeded {
                op: op.id.clone(),
                limit: self.max_link_depth,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Pre-images
    // =========================================================================

    /// Record the pre-image of an entity about to be destroyed or resized.
    ///
    /// The first pre-image recorded for an entity wins; later calls for the
    /// same entity and operation leave it in place, so rollback always
    /// restores the state from before the operation touched it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] if the operation does not exist.
    pub fn record_preimage(&self, op: &OpId, snapshot: &EntitySnapshot) -> Result<()> {
        if !self.store.exists(&op_key(op))? {
            return Err(LedgerError::NotFound(op.clone()));
        }
        let key = preimage_key(op, &snapshot.id);
        let value = serde_json::to_string(snapshot)?;
        match self.store.compare_and_swap(&key, None, &value) {
            Ok(_) => {
                debug!(op = %op, entity = %snapshot.id, "recorded pre-image");
                Ok(())
            }
            Err(e) if e.is_cas_failure() => {
                debug!(op = %op, entity = %snapshot.id, "pre-image already recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The recorded pre-image of `entity` under `op`.
    pub fn preimage(&self, op: &OpId, entity: &EntityId) -> Result<Option<EntitySnapshot>> {
        let key = preimage_key(op, entity);
        match self.store.get(&key)? {
            Some(entry) => Ok(Some(decode(&key, &entry.value)?)),
            None => Ok(None),
        }
    }

    /// Delete every pre-image recorded under `op`. Returns how many went.
    pub fn drop_preimages(&self, op: &OpId) -> Result<usize> {
        let mut dropped = 0;
        for key in self.store.list(&preimage_prefix(op))? {
            match self.store.delete(&key, None) {
                Ok(()) => dropped += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(dropped)
    }

    /// Every recorded pre-image, as `(operation, entity)` pairs.
    pub fn preimages(&self) -> Result<Vec<(OpId, EntityId)>> {
        let mut out = Vec::new();
        for key in self.store.list(PREIMAGE_PREFIX)? {
            let rest = key.trim_start_matches(PREIMAGE_PREFIX);
            let parsed = rest.split_once('/').and_then(|(op, entity)| {
                Some((OpId::parse(op).ok()?, EntityId::new(entity).ok()?))
            });
            match parsed {
                Some(pair) => out.push(pair),
                None => {
                    return Err(LedgerError::Corrupt {
                        key,
                        message: "malformed pre-image key".into(),
                    })
                }
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Markers
    // =========================================================================

    /// Current pending marker of an entity.
    pub fn owner(&self, entity: &EntityId) -> Result<Option<PendingMarker>> {
        Ok(self.locks().owner(entity)?)
    }

    /// Release the markers of every entity `op` names. Returns the
    /// released entities.
    ///
    /// Only the record's own entities are visited; markers held by another
    /// operation are left alone.
    pub fn release_markers(&self, op: &PendingOperation) -> Result<Vec<EntityId>> {
        let locks = self.locks();
        let mut released = Vec::new();
        for (_, entity) in op.entities() {
            if locks.release(&op.id, entity)? == Release::Released {
                released.push(entity.clone());
            }
        }
        Ok(released)
    }

    /// Release every marker still owned by one of `finished`, in a single
    /// scan. Returns the released entities.
    ///
    /// Catches markers whose enrollment outlived a failed append, which the
    /// record never names.
    pub fn sweep_markers(&self, finished: &BTreeSet<OpId>) -> Result<Vec<EntityId>> {
        if finished.is_empty() {
            return Ok(Vec::new());
        }
        let locks = self.locks();
        let mut released = Vec::new();
        for (entity, marker) in locks.markers()? {
            if !finished.contains(&marker.op_id) {
                continue;
            }
            if locks.release(&marker.op_id, &entity)? == Release::Released {
                debug!(op = %marker.op_id, entity = %entity, "swept leftover marker");
                released.push(entity);
            }
        }
        Ok(released)
    }
}
