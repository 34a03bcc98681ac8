//! core::ops
//!
//! Pending-operation records and entity enrollment.
//!
//! # Modules
//!
//! - [`pending`] - The pending-operation record and its action log
//! - [`lock`] - Per-entity pending markers
//!
//! # Architecture
//!
//! Every tracked workflow:
//! 1. Creates a pending-operation record before touching any entity
//! 2. Enrolls each entity it is about to mutate
//! 3. Appends one action per mutation and persists the record
//! 4. On success: commit releases the markers and deletes the record
//! 5. On failure: rollback undoes the actions in reverse, then does the same

pub mod lock;
pub mod pending;

pub use lock::{EntityLocks, Enrollment, LockError, PendingMarker, Release};
pub use pending::{PendingOperation, RollbackSummary};
