//! opledger - a crash-durable ledger of pending operations
//!
//! Storage orchestration workflows (create a volume, expand it, evict a
//! brick, remove a device) change several entities one step at a time. The
//! ledger records each step before it takes effect, so a workflow that fails
//! or is interrupted by a crash can be rolled back, and a workflow that
//! succeeds can be retired cleanly.
//!
//! # Architecture
//!
//! - [`core`] - Domain types, kind tables, actions, and the pending record
//! - [`store`] - Key-value persistence with compare-and-swap revisions
//! - [`entities`] - Boundary to the entity store that inverses are applied to
//! - [`engine`] - Registry, rollback, commit, and crash recovery
//! - [`doctor`] - Read-only consistency checks
//! - [`cli`] - The `opledger` inspection binary
//!
//! # Correctness Invariants
//!
//! 1. An entity is pending under at most one operation at a time
//! 2. Every record write is a compare-and-swap against the revision read
//! 3. A destructive action is recorded only after its pre-image
//! 4. Re-running commit or rollback never reports a failure for work
//!    already done

pub mod cli;
pub mod core;
pub mod doctor;
pub mod engine;
pub mod entities;
pub mod store;
