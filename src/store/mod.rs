//! store
//!
//! Key-value persistence for ledger records and pending markers.
//!
//! # Architecture
//!
//! Everything the ledger persists goes through the [`KvStore`] trait, which
//! has two implementations:
//!
//! - [`MemoryStore`]: in-process map (tests, embedding)
//! - [`FileStore`]: one JSON file per key under a root directory
//!
//! # Key Layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `ops/<op-id>` | pending operation record |
//! | `pending/<entity-id>` | pending marker (entity lock) |
//! | `preimage/<op-id>/<entity-id>` | entity pre-image for rollback |

mod file_store;
mod memory;
mod traits;

pub use file_store::FileStore;
pub use memory::MemoryStore;
pub use traits::{KvStore, StoreError, Versioned};

use crate::core::types::{EntityId, OpId};

/// Prefix for pending operation records.
pub const OPS_PREFIX: &str = "ops/";
/// Prefix for entity pending markers.
pub const PENDING_PREFIX: &str = "pending/";
/// Prefix for recorded pre-images.
pub const PREIMAGE_PREFIX: &str = "preimage/";

/// Key of an operation record.
pub fn op_key(id: &OpId) -> String {
    format!("{}{}", OPS_PREFIX, id)
}

/// Key of an entity's pending marker.
pub fn pending_key(entity: &EntityId) -> String {
    format!("{}{}", PENDING_PREFIX, entity)
}

/// Key prefix covering all pre-images of one operation.
pub fn preimage_prefix(op: &OpId) -> String {
    format!("{}{}/", PREIMAGE_PREFIX, op)
}

/// Key of one pre-image.
pub fn preimage_key(op: &OpId, entity: &EntityId) -> String {
    format!("{}{}", preimage_prefix(op), entity)
}

/// Fault injection support for testing crash recovery.
///
/// Lets tests make the N-th store write fail as if the process died at that
/// point, so that rollback and commit resumption can be exercised.
///
/// # Usage
///
/// ```ignore
/// use opledger::store::fault_injection;
///
/// // The second write "crashes"
/// fault_injection::set_crash_after(2);
/// // ... drive the ledger ...
/// fault_injection::reset();
/// ```
#[cfg(any(test, feature = "fault_injection"))]
pub mod fault_injection {
    use std::cell::Cell;

    use super::StoreError;

    // Thread-local so parallel test threads do not interfere.
    thread_local! {
        /// Crash on the N-th write; 0 disables.
        static CRASH_AFTER_WRITES: Cell<usize> = const { Cell::new(0) };

        /// Writes attempted since the last reset.
        static WRITE_COUNT: Cell<usize> = const { Cell::new(0) };
    }

    /// Make the `n`-th write from now fail. Set to 0 to disable.
    pub fn set_crash_after(n: usize) {
        CRASH_AFTER_WRITES.with(|c| c.set(n));
        WRITE_COUNT.with(|c| c.set(0));
    }

    /// Whether the current write should fail.
    pub fn should_crash() -> bool {
        CRASH_AFTER_WRITES.with(|threshold_cell| {
            let threshold = threshold_cell.get();
            if threshold == 0 {
                return false;
            }
            WRITE_COUNT.with(|count_cell| {
                let count = count_cell.get() + 1;
                count_cell.set(count);
                count >= threshold
            })
        })
    }

    /// Reset fault injection state.
    pub fn reset() {
        CRASH_AFTER_WRITES.with(|c| c.set(0));
        WRITE_COUNT.with(|c| c.set(0));
    }

    /// Writes attempted since the last reset.
    pub fn write_count() -> usize {
        WRITE_COUNT.with(|c| c.get())
    }

    pub(crate) fn simulated_crash() -> StoreError {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "simulated crash for fault injection testing",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let op = OpId::parse("op1").unwrap();
        let entity = EntityId::new("vol-1").unwrap();
        assert_eq!(op_key(&op), "ops/op1");
        assert_eq!(pending_key(&entity), "pending/vol-1");
        assert_eq!(preimage_key(&op, &entity), "preimage/op1/vol-1");
        assert!(preimage_key(&op, &entity).starts_with(&preimage_prefix(&op)));
    }

    mod fault_injection_tests {
        use super::*;

        #[test]
        fn crash_threshold_triggers_at_exact_count() {
            fault_injection::set_crash_after(2);
            let store = MemoryStore::new();
            assert!(store.compare_and_swap("a", None, "{}").is_ok());
            assert!(store.compare_and_swap("b", None, "{}").is_err());
            assert_eq!(fault_injection::write_count(), 2);
            fault_injection::reset();
            assert!(store.compare_and_swap("b", None, "{}").is_ok());
        }

        #[test]
        fn disabled_fault_injection_allows_all_writes() {
            fault_injection::reset();
            let store = MemoryStore::new();
            for i in 0..10 {
                store
                    .compare_and_swap(&format!("k{}", i), None, "{}")
                    .unwrap();
            }
        }
    }
}
