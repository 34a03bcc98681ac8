//! engine
//!
//! Lifecycle of pending operations: record, then commit or roll back.
//!
//! # Architecture
//!
//! A workflow drives its record through the [`Registry`]:
//!
//! ```text
//! Create -> Append* -> finalize(Commit | Rollback)
//! ```
//!
//! 1. **Create**: allocate a record with a fresh id
//! 2. **Append**: validate, enroll the entity, persist each action
//! 3. **Finalize**: the caller's [`Outcome`] picks the path
//!    - [`CommitFinalizer`] releases markers and retires the record
//!    - [`RollbackEngine`] applies inverses in reverse order, then retires
//!
//! [`Recovery`] re-drives finalization for records left behind by a crash.
//!
//! # Invariants
//!
//! - An entity is pending under at most one operation at a time
//! - Operation links form a forest of bounded depth
//! - A destructive action is only recorded once its pre-image is
//! - Re-running a finalization never applies an effect twice, except the
//!   single inverse in flight when a crash interrupted a rollback
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use opledger::core::kinds::{ChangeKind, EntityKind, OperationKind};
//! use opledger::core::types::EntityId;
//! use opledger::engine::{finalize, Outcome, Registry};
//! use opledger::entities::MemoryEntities;
//! use opledger::store::MemoryStore;
//!
//! let registry = Registry::new(Arc::new(MemoryStore::new()));
//! let brick = EntityId::new("brick-1").unwrap();
//! let entities = MemoryEntities::new().with_entity(EntityKind::Brick, brick.clone(), None);
//!
//! let mut op = registry.create(OperationKind::CreateVolume).unwrap();
//! registry.append(&mut op, ChangeKind::AddBrick, brick.clone(), None).unwrap();
//!
//! let report = finalize(&registry, &entities, &op, Outcome::Rollback).unwrap();
//! assert!(report.complete);
//! assert!(entities.get(&brick).is_none());
//! ```

pub mod commit;
pub mod error;
pub mod links;
pub mod recovery;
pub mod registry;
pub mod report;
pub mod rollback;

pub use commit::CommitFinalizer;
pub use error::{LedgerError, Result};
pub use links::LinkGraph;
pub use recovery::{finalize, stale_operations, DecisionLog, Recovery, RecoveryReport};
pub use registry::Registry;
pub use report::{ActionOutcome, FinalizeReport, Outcome, StepReport};
pub use rollback::RollbackEngine;
