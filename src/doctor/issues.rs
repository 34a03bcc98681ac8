//! doctor::issues
//!
//! Known ledger inconsistencies.
//!
//! # Architecture
//!
//! Each variant of [`KnownIssue`] names one kind of damage the doctor can
//! find. Issues carry a stable [`IssueId`] derived from their evidence, so
//! the same problem has the same id across runs and can be tracked by an
//! operator between checks.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::kinds::{ChangeKind, EntityKind};
use crate::core::types::{EntityId, OpId};

/// How serious an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    /// The ledger is inconsistent; finalization may misbehave.
    Blocking,
    /// Something is off but finalization copes with it.
    Warning,
    /// For the operator's attention only.
    Info,
}

impl Severity {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::Blocking)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Blocking => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// A stable, deterministic issue identifier.
///
/// # Example
///
/// ```
/// use opledger::doctor::IssueId;
///
/// let id = IssueId::new("orphan-marker", "vol-1");
/// assert!(id.as_str().starts_with("orphan-marker:"));
/// assert_eq!(id, IssueId::new("orphan-marker", "vol-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IssueId(String);

impl IssueId {
    /// Create an id formatted as `type:hash(key)`, the hash being a
    /// truncated SHA-256 of the key.
    pub fn new(issue_type: &str, key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        Self(format!("{}:{}", issue_type, hex::encode(&hash[..4])))
    }

    /// Create an id for an issue that can only occur once.
    pub fn singleton(issue_type: &str) -> Self {
        Self(issue_type.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IssueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inconsistencies the doctor can diagnose.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KnownIssue {
    /// A stored record or marker could not be decoded.
    #[error("corrupt entry {key}: {message}")]
    CorruptEntry { key: String, message: String },

    /// An entity is marked pending under an operation that does not exist.
    #[error("{entity} marked pending but no pending operation {op}")]
    OrphanMarker { entity: EntityId, op: OpId },

    /// An entity is marked pending under an operation that never recorded it.
    #[error("{entity} marked pending by {op} but not named by any of its actions")]
    UnrecordedMarker { entity: EntityId, op: OpId },

    /// An action names an entity that is not marked pending under its
    /// operation.
    #[error("{entity} in {op} is not marked pending{}", holder_suffix(.holder))]
    UnmarkedEntity {
        op: OpId,
        entity: EntityId,
        holder: Option<OpId>,
    },

    /// An operation links to an operation that does not exist.
    #[error("{op} links to missing operation {linked}")]
    DanglingLink { op: OpId, linked: OpId },

    /// Stored links close a cycle.
    #[error("operation link cycle: {trace}")]
    LinkCycle { trace: String, ops: Vec<OpId> },

    /// An action names an entity the entity store does not have.
    #[error("{kind} {entity} in {op} change '{change}' missing")]
    MissingEntity {
        op: OpId,
        change: ChangeKind,
        kind: EntityKind,
        entity: EntityId,
    },

    /// An action carries a change that can never be finalized.
    #[error("{op} has unexpected change type '{change}' for {entity}")]
    UnexpectedChange {
        op: OpId,
        change: ChangeKind,
        entity: EntityId,
    },

    /// A pre-image is stored for an operation that does not exist.
    #[error("pre-image of {entity} left by finished operation {op}")]
    OrphanPreimage { op: OpId, entity: EntityId },

    /// An operation has been pending longer than the stale threshold.
    #[error("{op} pending for {age_secs}s")]
    StaleOperation { op: OpId, age_secs: i64 },
}

fn holder_suffix(holder: &Option<OpId>) -> String {
    match holder {
        Some(op) => format!(" (held by {})", op),
        None => String::new(),
    }
}

impl KnownIssue {
    /// Stable id for this issue.
    pub fn issue_id(&self) -> IssueId {
        match self {
            KnownIssue::CorruptEntry { key, .. } => IssueId::new("corrupt-entry", key),
            KnownIssue::OrphanMarker { entity, .. } => {
                IssueId::new("orphan-marker", entity.as_str())
            }
            KnownIssue::UnrecordedMarker { entity, .. } => {
                IssueId::new("unrecorded-marker", entity.as_str())
            }
            KnownIssue::UnmarkedEntity { op, entity, .. } => {
                IssueId::new("unmarked-entity", &format!("{}/{}", op, entity))
            }
            KnownIssue::DanglingLink { op, linked } => {
                IssueId::new("dangling-link", &format!("{}/{}", op, linked))
            }
            KnownIssue::LinkCycle { ops, .. } => {
                let mut sorted: Vec<&str> = ops.iter().map(OpId::as_str).collect();
                sorted.sort_unstable();
                sorted.dedup();
                IssueId::new("link-cycle", &sorted.join(","))
            }
            KnownIssue::MissingEntity { op, entity, .. } => {
                IssueId::new("missing-entity", &format!("{}/{}", op, entity))
            }
            KnownIssue::UnexpectedChange { op, entity, .. } => {
                IssueId::new("unexpected-change", &format!("{}/{}", op, entity))
            }
            KnownIssue::OrphanPreimage { op, entity } => {
                IssueId::new("orphan-preimage", &format!("{}/{}", op, entity))
            }
            KnownIssue::StaleOperation { op, .. } => IssueId::new("stale-operation", op.as_str()),
        }
    }

    /// Severity of this issue.
    pub fn severity(&self) -> Severity {
        match self {
            KnownIssue::CorruptEntry { .. } => Severity::Blocking,
            KnownIssue::OrphanMarker { .. } => Severity::Blocking,
            KnownIssue::LinkCycle { .. } => Severity::Blocking,
            KnownIssue::UnexpectedChange { .. } => Severity::Blocking,
            KnownIssue::UnrecordedMarker { .. } => Severity::Warning,
            KnownIssue::UnmarkedEntity { .. } => Severity::Warning,
            KnownIssue::DanglingLink { .. } => Severity::Warning,
            KnownIssue::MissingEntity { .. } => Severity::Warning,
            KnownIssue::OrphanPreimage { .. } => Severity::Info,
            KnownIssue::StaleOperation { .. } => Severity::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(s: &str) -> OpId {
        OpId::parse(s).unwrap()
    }

    fn entity(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    mod issue_id {
        use super::*;

        #[test]
        fn hashed_suffix_is_eight_hex_chars() {
            let id = IssueId::new("orphan-marker", "vol-1");
            let (prefix, hash) = id.as_str().split_once(':').unwrap();
            assert_eq!(prefix, "orphan-marker");
            assert_eq!(hash.len(), 8);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn different_keys_differ() {
            assert_ne!(IssueId::new("x", "a"), IssueId::new("x", "b"));
        }

        #[test]
        fn singleton_is_bare() {
            assert_eq!(IssueId::singleton("store-empty").as_str(), "store-empty");
        }

        #[test]
        fn cycle_id_ignores_rotation() {
            let a = KnownIssue::LinkCycle {
                trace: "a -> b -> a".into(),
                ops: vec![op("a"), op("b"), op("a")],
            };
            let b = KnownIssue::LinkCycle {
                trace: "b -> a -> b".into(),
                ops: vec![op("b"), op("a"), op("b")],
            };
            assert_eq!(a.issue_id(), b.issue_id());
        }
    }

    mod display {
        use super::*;

        #[test]
        fn orphan_marker_message() {
            let issue = KnownIssue::OrphanMarker {
                entity: entity("vol-1"),
                op: op("op-9"),
            };
            assert_eq!(
                issue.to_string(),
                "vol-1 marked pending but no pending operation op-9"
            );
            assert!(issue.severity().is_blocking());
        }

        #[test]
        fn unmarked_entity_names_holder() {
            let issue = KnownIssue::UnmarkedEntity {
                op: op("a"),
                entity: entity("b1"),
                holder: Some(op("b")),
            };
            assert_eq!(issue.to_string(), "b1 in a is not marked pending (held by b)");
        }

        #[test]
        fn severity_display() {
            assert_eq!(Severity::Blocking.to_string(), "error");
            assert_eq!(Severity::Warning.to_string(), "warning");
            assert_eq!(Severity::Info.to_string(), "info");
        }
    }
}
