//! entities::traits
//!
//! Boundary to the stores that own bricks, volumes, block volumes, and
//! devices.
//!
//! # Design
//!
//! The ledger never mutates entities except to undo a recorded action.
//! The `EntityStore` trait exposes exactly the inverse operations rollback
//! needs. Implementations signal "already in the target state" through
//! dedicated error variants ([`EntityError::NotFound`],
//! [`EntityError::AlreadyExists`], [`EntityError::AlreadyAttached`]), which
//! the rollback engine reports as stale rather than as failures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::kinds::EntityKind;
use crate::core::types::EntityId;

/// Errors from entity store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityError {
    /// The entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    /// The entity already exists.
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: EntityKind, id: EntityId },

    /// The device is already attached.
    #[error("device {0} already attached")]
    AlreadyAttached(EntityId),

    /// A size reversal would underflow the recorded size.
    #[error("cannot shrink {kind} {id} by {by}: size is {size}")]
    SizeUnderflow {
        kind: EntityKind,
        id: EntityId,
        size: u64,
        by: u64,
    },

    /// The backing store failed.
    #[error("entity store failure: {0}")]
    Backend(String),
}

impl EntityError {
    /// Whether the error means the inverse has effectively already happened.
    pub fn is_already_applied(&self) -> bool {
        matches!(
            self,
            EntityError::NotFound { .. }
                | EntityError::AlreadyExists { .. }
                | EntityError::AlreadyAttached(_)
        )
    }
}

/// Pre-image of an entity, captured before a destructive change.
///
/// The calling workflow records it through
/// [`Registry::record_preimage`](crate::engine::registry::Registry::record_preimage)
/// before appending the action; rollback hands it back to
/// [`EntityStore::restore`] or [`EntityStore::set_size`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id.
    pub id: EntityId,
    /// Recorded size, if the entity has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Opaque attributes owned by the entity store.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl EntitySnapshot {
    /// A snapshot with no size and no attributes.
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self {
            kind,
            id,
            size: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Set the recorded size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Trait for the entity stores rollback operates on.
///
/// Implementations must be thread-safe (Send + Sync).
pub trait EntityStore: Send + Sync {
    /// Remove an entity that a rolled-back action created.
    ///
    /// Returns [`EntityError::NotFound`] if it is already gone.
    fn remove(&self, kind: EntityKind, id: &EntityId) -> Result<(), EntityError>;

    /// Re-create an entity from its pre-image.
    ///
    /// Returns [`EntityError::AlreadyExists`] if it is already present.
    fn restore(&self, snapshot: &EntitySnapshot) -> Result<(), EntityError>;

    /// An entity's recorded size.
    ///
    /// Returns [`EntityError::NotFound`] if it does not exist.
    fn size(&self, kind: EntityKind, id: &EntityId) -> Result<u64, EntityError>;

    /// Set an entity's recorded size.
    fn set_size(&self, kind: EntityKind, id: &EntityId, size: u64) -> Result<(), EntityError>;

    /// Re-attach a removed device.
    ///
    /// Returns [`EntityError::AlreadyAttached`] if it is attached.
    fn reattach_device(&self, id: &EntityId) -> Result<(), EntityError>;

    /// Whether an entity exists.
    fn exists(&self, kind: EntityKind, id: &EntityId) -> Result<bool, EntityError>;
}
