//! core::ops::lock
//!
//! Per-entity enrollment locks.
//!
//! # Architecture
//!
//! Before an action naming an entity may be appended, the entity is marked
//! pending with a back-reference to the owning operation. The marker lives
//! in the shared store at `pending/<entity-id>`, so ownership survives a
//! restart and any process can release it.
//!
//! # Invariants
//!
//! - At most one operation holds an entity at a time (create-only CAS)
//! - Re-enrolling under the owning operation is a no-op
//! - A marker is only deleted by its owner, at the revision it was read at
//!
//! # Example
//!
//! ```
//! use opledger::core::kinds::EntityKind;
//! use opledger::core::ops::lock::{EntityLocks, Enrollment, LockError};
//! use opledger::core::types::{EntityId, OpId};
//! use opledger::store::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let locks = EntityLocks::new(&store, 5);
//! let vol = EntityId::new("vol-1").unwrap();
//! let (a, b) = (OpId::new(), OpId::new());
//!
//! assert_eq!(locks.enroll(&a, EntityKind::Volume, &vol).unwrap(), Enrollment::Acquired);
//! assert_eq!(locks.enroll(&a, EntityKind::Volume, &vol).unwrap(), Enrollment::AlreadyHeld);
//! assert!(matches!(
//!     locks.enroll(&b, EntityKind::Volume, &vol),
//!     Err(LockError::Held { .. })
//! ));
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::kinds::EntityKind;
use crate::core::types::{EntityId, OpId, Revision, UtcTimestamp};
use crate::store::{pending_key, KvStore, StoreError, PENDING_PREFIX};

/// Errors from enrollment operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another operation already holds the entity.
    #[error("{entity} is pending under operation {owner}")]
    Held { entity: EntityId, owner: OpId },

    /// Lost the CAS race on the marker too many times.
    #[error("gave up on marker for {entity} after {attempts} attempts")]
    Contended { entity: EntityId, attempts: u32 },

    /// A stored marker could not be decoded.
    #[error("corrupt pending marker for {entity}: {message}")]
    Corrupt { entity: EntityId, message: String },

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Back-reference an enrolled entity carries to its owning operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMarker {
    /// Owning operation.
    pub op_id: OpId,
    /// Kind of the enrolled entity.
    pub entity_kind: EntityKind,
    /// When the entity was enrolled.
    pub enrolled_at: UtcTimestamp,
}

/// Result of an enrollment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrollment {
    /// The marker was written by this call.
    Acquired,
    /// The operation already held the entity.
    AlreadyHeld,
}

/// Result of a release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// The marker was deleted.
    Released,
    /// No marker existed.
    NotHeld,
    /// The marker belongs to another operation and was left alone.
    HeldByOther(OpId),
}

/// Enrollment locks over a shared store.
pub struct EntityLocks<'a> {
    store: &'a dyn KvStore,
    max_retries: u32,
}

impl<'a> EntityLocks<'a> {
    /// Wrap a store. `max_retries` bounds CAS retry loops.
    pub fn new(store: &'a dyn KvStore, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
        }
    }

    fn read(&self, entity: &EntityId) -> Result<Option<(Revision, PendingMarker)>, LockError> {
        let Some(entry) = self.store.get(&pending_key(entity))? else {
            return Ok(None);
        };
        let marker = serde_json::from_str(&entry.value).map_err(|e| LockError::Corrupt {
            entity: entity.clone(),
            message: e.to_string(),
        })?;
        Ok(Some((entry.revision, marker)))
    }

    /// Current owner of an entity, if it is enrolled.
    pub fn owner(&self, entity: &EntityId) -> Result<Option<PendingMarker>, LockError> {
        Ok(self.read(entity)?.map(|(_, marker)| marker))
    }

    /// Enroll `entity` under `op`.
    ///
    /// # Errors
    ///
    /// - [`LockError::Held`] if another operation owns the entity
    /// - [`LockError::Contended`] if the CAS race was lost `max_retries` times
    pub fn enroll(
        &self,
        op: &OpId,
        kind: EntityKind,
        entity: &EntityId,
    ) -> Result<Enrollment, LockError> {
        let marker = PendingMarker {
            op_id: op.clone(),
            entity_kind: kind,
            enrolled_at: UtcTimestamp::now(),
        };
        let value = serde_json::to_string(&marker).map_err(|e| LockError::Corrupt {
            entity: entity.clone(),
            message: e.to_string(),
        })?;

        for attempt in 1..=self.max_retries {
            if let Some((_, current)) = self.read(entity)? {
                if current.op_id == *op {
                    return Ok(Enrollment::AlreadyHeld);
                }
                return Err(LockError::Held {
                    entity: entity.clone(),
                    owner: current.op_id,
                });
            }
            match self.store.compare_and_swap(&pending_key(entity), None, &value) {
                Ok(_) => {
                    debug!(op = %op, entity = %entity, "enrolled entity");
                    return Ok(Enrollment::Acquired);
                }
                Err(e) if e.is_cas_failure() => {
                    debug!(op = %op, entity = %entity, attempt, "lost enrollment race");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(op = %op, entity = %entity, "enrollment contended");
        Err(LockError::Contended {
            entity: entity.clone(),
            attempts: self.max_retries,
        })
    }

    /// Release `entity` if `op` holds it.
    pub fn release(&self, op: &OpId, entity: &EntityId) -> Result<Release, LockError> {
        for _ in 0..self.max_retries {
            let Some((revision, current)) = self.read(entity)? else {
                return Ok(Release::NotHeld);
            };
            if current.op_id != *op {
                return Ok(Release::HeldByOther(current.op_id));
            }
            match self.store.delete(&pending_key(entity), Some(revision)) {
                Ok(()) => {
                    debug!(op = %op, entity = %entity, "released entity");
                    return Ok(Release::Released);
                }
                Err(StoreError::NotFound(_)) => return Ok(Release::NotHeld),
                Err(e) if e.is_cas_failure() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(LockError::Contended {
            entity: entity.clone(),
            attempts: self.max_retries,
        })
    }

    /// All markers in the store, by entity.
    pub fn markers(&self) -> Result<Vec<(EntityId, PendingMarker)>, LockError> {
        let mut out = Vec::new();
        for key in self.store.list(PENDING_PREFIX)? {
            let raw = key.trim_start_matches(PENDING_PREFIX);
            let entity = EntityId::new(raw).map_err(|e| {
                LockError::Store(StoreError::InvalidKey(format!("{}: {}", key, e)))
            })?;
            if let Some((_, marker)) = self.read(&entity)? {
                out.push((entity, marker));
            }
        }
        Ok(out)
    }
}
