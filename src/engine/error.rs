//! engine::error
//!
//! The ledger's error type.
//!
//! Lower layers keep their own error enums (`StoreError`, `EntityError`,
//! `DeltaError`, `LockError`); they fold into [`LedgerError`] here. A lost
//! compare-and-swap from the store becomes [`LedgerError::StorageConflict`]
//! and a refused enrollment becomes [`LedgerError::Conflict`].

use thiserror::Error;

use crate::core::delta::DeltaError;
use crate::core::ops::LockError;
use crate::core::types::{EntityId, OpId};
use crate::entities::EntityError;
use crate::store::StoreError;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No pending operation with this id exists.
    #[error("pending operation not found: {0}")]
    NotFound(OpId),

    /// An action payload does not fit its change kind.
    #[error(transparent)]
    InvalidDelta(#[from] DeltaError),

    /// The action cannot be appended (unknown change, closed record, ...).
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// The entity or record is held by another operation, or a retried
    /// read-modify-write kept losing.
    #[error("conflict on {subject}{}", owner_suffix(.owner))]
    Conflict {
        /// What was contended (entity id or record key).
        subject: String,
        /// Current owner, when known.
        owner: Option<OpId>,
    },

    /// Linking the operations would close a cycle.
    #[error("operation link cycle detected: {}", render_trace(.trace))]
    CycleDetected {
        /// The cycle, first element repeated at the end.
        trace: Vec<OpId>,
    },

    /// Child operations are nested deeper than allowed.
    #[error("operation {op} exceeds the link depth limit of {limit}")]
    LinkDepthExceeded { op: OpId, limit: usize },

    /// A destructive action has no recorded pre-image.
    #[error("no pre-image recorded for {entity} in operation {op}")]
    MissingPreimage { op: OpId, entity: EntityId },

    /// The inverse of an action has already taken effect.
    #[error("stale action in {op}: {action} ({reason})")]
    StaleAction {
        op: OpId,
        action: String,
        reason: String,
    },

    /// The record changed since it was read.
    #[error("storage conflict on {key}: record changed since it was read")]
    StorageConflict { key: String },

    /// A linked child operation was not finalized completely.
    #[error("child operation {child} was not finalized completely")]
    ChildIncomplete { child: OpId },

    /// A stored value could not be decoded.
    #[error("corrupt ledger entry {key}: {message}")]
    Corrupt { key: String, message: String },

    /// Store failure.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Entity store failure.
    #[error("entity error: {0}")]
    Entity(#[from] EntityError),

    /// Record serialization failure.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn owner_suffix(owner: &Option<OpId>) -> String {
    match owner {
        Some(op) => format!(": held by operation {}", op),
        None => String::new(),
    }
}

fn render_trace(trace: &[OpId]) -> String {
    trace
        .iter()
        .map(OpId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CasFailed { key, .. } => LedgerError::StorageConflict { key },
            StoreError::Corrupt { key, message } => LedgerError::Corrupt { key, message },
            other => LedgerError::Store(other),
        }
    }
}

impl From<LockError> for LedgerError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { entity, owner } => LedgerError::Conflict {
                subject: entity.to_string(),
                owner: Some(owner),
            },
            LockError::Contended { entity, .. } => LedgerError::Conflict {
                subject: entity.to_string(),
                owner: None,
            },
            LockError::Corrupt { entity, message } => LedgerError::Corrupt {
                key: crate::store::pending_key(&entity),
                message,
            },
            LockError::Store(e) => e.into(),
        }
    }
}

impl LedgerError {
    /// Whether this is a lost compare-and-swap that a reload can fix.
    pub fn is_storage_conflict(&self) -> bool {
        matches!(self, LedgerError::StorageConflict { .. })
    }

    /// Whether this error reports an already-applied action.
    pub fn is_stale(&self) -> bool {
        matches!(self, LedgerError::StaleAction { .. })
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Revision;

    #[test]
    fn cas_failure_becomes_storage_conflict() {
        let err: LedgerError = StoreError::CasFailed {
            key: "ops/a".into(),
            expected: Some(Revision::new(1)),
            actual: Some(Revision::new(2)),
        }
        .into();
        assert!(err.is_storage_conflict());
        assert!(err.to_string().contains("ops/a"));
    }

    #[test]
    fn held_lock_becomes_conflict() {
        let owner = OpId::parse("op-a").unwrap();
        let err: LedgerError = LockError::Held {
            entity: EntityId::new("vol-1").unwrap(),
            owner: owner.clone(),
        }
        .into();
        match &err {
            LedgerError::Conflict { subject, owner: o } => {
                assert_eq!(subject, "vol-1");
                assert_eq!(o.as_ref(), Some(&owner));
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
        assert_eq!(err.to_string(), "conflict on vol-1: held by operation op-a");
    }

    #[test]
    fn cycle_trace_display() {
        let trace = vec![
            OpId::parse("a").unwrap(),
            OpId::parse("b").unwrap(),
            OpId::parse("a").unwrap(),
        ];
        let err = LedgerError::CycleDetected { trace };
        assert_eq!(err.to_string(), "operation link cycle detected: a -> b -> a");
    }

    #[test]
    fn other_store_errors_are_wrapped() {
        let err: LedgerError = StoreError::Lock("poisoned".into()).into();
        assert!(matches!(err, LedgerError::Store(_)));
        assert!(!err.is_storage_conflict());
    }
}
