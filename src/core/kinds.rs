//! core::kinds
//!
//! Operation and change kinds, and their name tables.
//!
//! # Name Tables
//!
//! Names are looked up in static tables indexed by the enumeration's
//! numeric code. Both enumerations are closed, so every declared value has
//! a table slot; raw codes outside the declared range (for example from a
//! foreign database dump) resolve to the enumeration's `Unknown` name.
//! Lookups never fail.
//!
//! Numeric codes follow the historical ordering: `Unknown` is 0 and the
//! remaining values are numbered in declaration order.
//!
//! # Example
//!
//! ```
//! use opledger::core::kinds::{ChangeKind, OperationKind};
//!
//! assert_eq!(OperationKind::ExpandVolume.name(), "expand-volume");
//! assert_eq!(ChangeKind::AddBrick.name(), "Add brick");
//! assert_eq!(OperationKind::name_of_code(999), "unknown");
//! ```

use serde::{Deserialize, Serialize};

/// The high-level workflow a pending operation tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Unknown = 0,
    CreateVolume = 1,
    DeleteVolume = 2,
    ExpandVolume = 3,
    CreateBlockVolume = 4,
    DeleteBlockVolume = 5,
    ExpandBlockVolume = 6,
    RemoveDevice = 7,
    CloneVolume = 8,
    BrickEvict = 9,
}

const OPERATION_KINDS: [OperationKind; 10] = [
    OperationKind::Unknown,
    OperationKind::CreateVolume,
    OperationKind::DeleteVolume,
    OperationKind::ExpandVolume,
    OperationKind::CreateBlockVolume,
    OperationKind::DeleteBlockVolume,
    OperationKind::ExpandBlockVolume,
    OperationKind::RemoveDevice,
    OperationKind::CloneVolume,
    OperationKind::BrickEvict,
];

const OPERATION_NAMES: [&str; 10] = [
    "unknown",
    "create-volume",
    "delete-volume",
    "expand-volume",
    "create-block-volume",
    "delete-block-volume",
    "expand-block-volume",
    "remove-device",
    "clone-volume",
    "evict-brick",
];

impl OperationKind {
    /// Every declared operation kind, in code order.
    pub const ALL: &'static [OperationKind] = &OPERATION_KINDS;

    /// Short, stable name of this kind.
    pub fn name(self) -> &'static str {
        OPERATION_NAMES[self as usize]
    }

    /// Numeric code of this kind.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a raw code to a kind; out-of-range codes map to `Unknown`.
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| OPERATION_KINDS.get(i).copied())
            .unwrap_or(OperationKind::Unknown)
    }

    /// Name of a raw code; out-of-range codes yield `"unknown"`.
    pub fn name_of_code(code: i64) -> &'static str {
        Self::from_code(code).name()
    }

    /// Parse a kind from its short name (as printed by [`name`](Self::name)).
    pub fn from_name(name: &str) -> Option<Self> {
        OPERATION_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| OPERATION_KINDS[i])
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A lower-level change recorded as one action of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Unknown = 0,
    AddBrick = 1,
    AddVolume = 2,
    DeleteBrick = 3,
    DeleteVolume = 4,
    ExpandVolume = 5,
    AddBlockVolume = 6,
    DeleteBlockVolume = 7,
    ExpandBlockVolume = 8,
    RemoveDevice = 9,
    CloneVolume = 10,
    SnapshotVolume = 11,
    AddVolumeClone = 12,
    ChildOperation = 13,
    ParentOperation = 14,
}

const CHANGE_KINDS: [ChangeKind; 15] = [
    ChangeKind::Unknown,
    ChangeKind::AddBrick,
    ChangeKind::AddVolume,
    ChangeKind::DeleteBrick,
    ChangeKind::DeleteVolume,
    ChangeKind::ExpandVolume,
    ChangeKind::AddBlockVolume,
    ChangeKind::DeleteBlockVolume,
    ChangeKind::ExpandBlockVolume,
    ChangeKind::RemoveDevice,
    ChangeKind::CloneVolume,
    ChangeKind::SnapshotVolume,
    ChangeKind::AddVolumeClone,
    ChangeKind::ChildOperation,
    ChangeKind::ParentOperation,
];

const CHANGE_NAMES: [&str; 15] = [
    "Unknown",
    "Add brick",
    "Add volume",
    "Delete brick",
    "Delete volume",
    "Expand volume",
    "Add block volume",
    "Delete block volume",
    "Expand block volume",
    "Remove device",
    "Clone volume from",
    "Snapshot volume",
    "Expand volume to",
    "Performing child operation",
    "Belongs to parent operation",
];

/// Kind of entity a change touches.
const CHANGE_ENTITIES: [Option<EntityKind>; 15] = [
    None,
    Some(EntityKind::Brick),
    Some(EntityKind::Volume),
    Some(EntityKind::Brick),
    Some(EntityKind::Volume),
    Some(EntityKind::Volume),
    Some(EntityKind::BlockVolume),
    Some(EntityKind::BlockVolume),
    Some(EntityKind::BlockVolume),
    Some(EntityKind::Device),
    Some(EntityKind::Volume),
    Some(EntityKind::Volume),
    Some(EntityKind::Volume),
    None,
    None,
];

impl ChangeKind {
    /// Every declared change kind, in code order.
    pub const ALL: &'static [ChangeKind] = &CHANGE_KINDS;

    /// Short human-readable description of this change.
    pub fn name(self) -> &'static str {
        CHANGE_NAMES[self as usize]
    }

    /// Numeric code of this kind.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a raw code to a kind; out-of-range codes map to `Unknown`.
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| CHANGE_KINDS.get(i).copied())
            .unwrap_or(ChangeKind::Unknown)
    }

    /// Name of a raw code; out-of-range codes yield `"Unknown"`.
    pub fn name_of_code(code: i64) -> &'static str {
        Self::from_code(code).name()
    }

    /// The kind of entity this change mutates.
    ///
    /// `None` for operation links and `Unknown`.
    pub fn entity_kind(self) -> Option<EntityKind> {
        CHANGE_ENTITIES[self as usize]
    }

    /// Whether this change links to another pending operation.
    pub fn is_link(self) -> bool {
        matches!(self, ChangeKind::ChildOperation | ChangeKind::ParentOperation)
    }

    /// Whether this change creates the entity it names.
    pub fn creates_entity(self) -> bool {
        matches!(
            self,
            ChangeKind::AddBrick
                | ChangeKind::AddVolume
                | ChangeKind::AddBlockVolume
                | ChangeKind::CloneVolume
                | ChangeKind::SnapshotVolume
                | ChangeKind::AddVolumeClone
        )
    }

    /// Whether this change destroys the entity it names.
    pub fn deletes_entity(self) -> bool {
        matches!(
            self,
            ChangeKind::DeleteBrick | ChangeKind::DeleteVolume | ChangeKind::DeleteBlockVolume
        )
    }

    /// Whether undoing this change needs a pre-image recorded up front.
    pub fn requires_preimage(self) -> bool {
        self.deletes_entity() || self == ChangeKind::ExpandBlockVolume
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The kinds of managed entity an action can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Brick,
    Volume,
    BlockVolume,
    Device,
}

impl EntityKind {
    /// Every entity kind.
    pub const ALL: &'static [EntityKind] = &[
        EntityKind::Brick,
        EntityKind::Volume,
        EntityKind::BlockVolume,
        EntityKind::Device,
    ];

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Brick => "brick",
            EntityKind::Volume => "volume",
            EntityKind::BlockVolume => "block volume",
            EntityKind::Device => "device",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
