//! core::delta
//!
//! Actions and their typed payloads.
//!
//! # Payload Shapes
//!
//! The payload an action may carry is fixed by its change kind:
//!
//! | Change | Payload |
//! |--------|---------|
//! | `ExpandVolume` | [`Delta::Size`] |
//! | `ChildOperation`, `ParentOperation` | [`Delta::Operation`] |
//! | everything else | none |
//!
//! [`Action::new`] checks the shape at construction time and persisted
//! actions are checked again on deserialization, so an `Action` with a
//! mismatched payload cannot exist. Payloads are read back through one
//! accessor per payload-bearing kind rather than a generic getter.
//!
//! # Example
//!
//! ```
//! use opledger::core::delta::{Action, Delta};
//! use opledger::core::kinds::ChangeKind;
//! use opledger::core::types::EntityId;
//!
//! let vol = EntityId::new("vol-1").unwrap();
//! let action = Action::new(ChangeKind::ExpandVolume, vol.clone(), Some(Delta::Size(5))).unwrap();
//! assert_eq!(action.expand_size().unwrap(), 5);
//!
//! // AddBrick carries no payload
//! assert!(Action::new(ChangeKind::AddBrick, vol, Some(Delta::Size(5))).is_err());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::kinds::ChangeKind;
use super::types::{EntityId, OpId};

/// Errors from payload validation and extraction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeltaError {
    /// The payload does not have the shape fixed for the change kind.
    #[error("invalid delta for '{change}': expected {expected}, found {found}")]
    ShapeMismatch {
        change: ChangeKind,
        expected: PayloadShape,
        found: PayloadShape,
    },

    /// A typed accessor was used on an action of a different kind.
    #[error("action delta for {accessor} is missing/invalid: action is '{change}'")]
    WrongAccessor {
        accessor: &'static str,
        change: ChangeKind,
    },
}

/// A typed action payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Delta {
    /// Size increase applied by a volume expansion.
    Size(u64),
    /// Identifier of a linked pending operation.
    Operation(OpId),
}

impl Delta {
    /// Shape of this payload.
    pub fn shape(&self) -> PayloadShape {
        match self {
            Delta::Size(_) => PayloadShape::Size,
            Delta::Operation(_) => PayloadShape::Operation,
        }
    }
}

/// The shape of payload a change kind carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    None,
    Size,
    Operation,
}

impl std::fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadShape::None => write!(f, "no payload"),
            PayloadShape::Size => write!(f, "size"),
            PayloadShape::Operation => write!(f, "operation id"),
        }
    }
}

const PAYLOAD_SHAPES: [PayloadShape; 15] = [
    PayloadShape::None,      // Unknown
    PayloadShape::None,      // AddBrick
    PayloadShape::None,      // AddVolume
    PayloadShape::None,      // DeleteBrick
    PayloadShape::None,      // DeleteVolume
    PayloadShape::Size,      // ExpandVolume
    PayloadShape::None,      // AddBlockVolume
    PayloadShape::None,      // DeleteBlockVolume
    PayloadShape::None,      // ExpandBlockVolume
    PayloadShape::None,      // RemoveDevice
    PayloadShape::None,      // CloneVolume
    PayloadShape::None,      // SnapshotVolume
    PayloadShape::None,      // AddVolumeClone
    PayloadShape::Operation, // ChildOperation
    PayloadShape::Operation, // ParentOperation
];

/// The payload shape fixed for a change kind.
pub fn payload_shape(change: ChangeKind) -> PayloadShape {
    PAYLOAD_SHAPES[change as usize]
}

/// Check that `delta` has the shape fixed for `change`.
///
/// # Errors
///
/// Returns [`DeltaError::ShapeMismatch`] when the payload is missing,
/// unexpected, or of the wrong type.
pub fn validate(change: ChangeKind, delta: Option<&Delta>) -> Result<(), DeltaError> {
    let expected = payload_shape(change);
    let found = delta.map_or(PayloadShape::None, Delta::shape);
    if expected == found {
        Ok(())
    } else {
        Err(DeltaError::ShapeMismatch {
            change,
            expected,
            found,
        })
    }
}

/// One recorded mutation step of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub struct Action {
    change: ChangeKind,
    entity_id: EntityId,
    delta: Option<Delta>,
}

/// Wire form of an [`Action`], validated on the way in.
#[derive(Serialize, Deserialize)]
struct RawAction {
    change: ChangeKind,
    entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<Delta>,
}

impl TryFrom<RawAction> for Action {
    type Error = DeltaError;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        Action::new(raw.change, raw.entity_id, raw.delta)
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        Self {
            change: action.change,
            entity_id: action.entity_id,
            delta: action.delta,
        }
    }
}

impl Action {
    /// Build an action, validating its payload shape.
    ///
    /// # Errors
    ///
    /// Returns [`DeltaError::ShapeMismatch`] if `delta` does not match the
    /// shape fixed for `change`.
    pub fn new(
        change: ChangeKind,
        entity_id: EntityId,
        delta: Option<Delta>,
    ) -> Result<Self, DeltaError> {
        validate(change, delta.as_ref())?;
        Ok(Self {
            change,
            entity_id,
            delta,
        })
    }

    /// An `ExpandVolume` action.
    pub fn expand_volume(volume: EntityId, size: u64) -> Self {
        Self {
            change: ChangeKind::ExpandVolume,
            entity_id: volume,
            delta: Some(Delta::Size(size)),
        }
    }

    /// A `ChildOperation` link to `child`.
    pub fn child_link(child: &OpId) -> Self {
        Self {
            change: ChangeKind::ChildOperation,
            entity_id: EntityId::from(child),
            delta: Some(Delta::Operation(child.clone())),
        }
    }

    /// A `ParentOperation` link to `parent`.
    pub fn parent_link(parent: &OpId) -> Self {
        Self {
            change: ChangeKind::ParentOperation,
            entity_id: EntityId::from(parent),
            delta: Some(Delta::Operation(parent.clone())),
        }
    }

    /// The change this action records.
    pub fn change(&self) -> ChangeKind {
        self.change
    }

    /// The entity (or linked operation) this action names.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// The raw payload, if any.
    pub fn delta(&self) -> Option<&Delta> {
        self.delta.as_ref()
    }

    /// Size delta of an `ExpandVolume` action.
    ///
    /// # Errors
    ///
    /// Returns [`DeltaError::WrongAccessor`] for any other change kind.
    pub fn expand_size(&self) -> Result<u64, DeltaError> {
        match (self.change, &self.delta) {
            (ChangeKind::ExpandVolume, Some(Delta::Size(size))) => Ok(*size),
            _ => Err(DeltaError::WrongAccessor {
                accessor: "ExpandSize",
                change: self.change,
            }),
        }
    }

    /// Linked child of a `ChildOperation` action.
    ///
    /// # Errors
    ///
    /// Returns [`DeltaError::WrongAccessor`] for any other change kind.
    pub fn child_operation(&self) -> Result<&OpId, DeltaError> {
        match (self.change, &self.delta) {
            (ChangeKind::ChildOperation, Some(Delta::Operation(id))) => Ok(id),
            _ => Err(DeltaError::WrongAccessor {
                accessor: "ChildOperation",
                change: self.change,
            }),
        }
    }

    /// Linked parent of a `ParentOperation` action.
    ///
    /// # Errors
    ///
    /// Returns [`DeltaError::WrongAccessor`] for any other change kind.
    pub fn parent_operation(&self) -> Result<&OpId, DeltaError> {
        match (self.change, &self.delta) {
            (ChangeKind::ParentOperation, Some(Delta::Operation(id))) => Ok(id),
            _ => Err(DeltaError::WrongAccessor {
                accessor: "ParentOperation",
                change: self.change,
            }),
        }
    }

    /// The operation this action links to, for either link direction.
    pub fn linked_operation(&self) -> Option<&OpId> {
        match &self.delta {
            Some(Delta::Operation(id)) => Some(id),
            _ => None,
        }
    }

    /// One-line description for logs and listings.
    pub fn describe(&self) -> String {
        match &self.delta {
            Some(Delta::Size(size)) => format!("{} {} (+{})", self.change, self.entity_id, size),
            Some(Delta::Operation(id)) => format!("{} {}", self.change, id),
            None => format!("{} {}", self.change, self.entity_id),
        }
    }
}
