//! entities
//!
//! Boundary to the stores that own the managed entities.
//!
//! # Modules
//!
//! - `traits` - The `EntityStore` trait, snapshots, and errors
//! - [`memory`] - In-memory implementation for tests and embedding
//!
//! The ledger only reaches into entity stores to undo recorded actions and,
//! in the doctor, to check that pending markers point at live entities.

pub mod memory;
mod traits;

pub use memory::MemoryEntities;
pub use traits::{EntityError, EntitySnapshot, EntityStore};
