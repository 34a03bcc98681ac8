//! store::traits
//!
//! Key-value store trait definition.
//!
//! # Design
//!
//! The `KvStore` trait is the single doorway between the ledger and its
//! persistence. Keys are `/`-separated strings (e.g. `ops/<op-id>`); values
//! are JSON documents. Every write is a compare-and-swap against a
//! [`Revision`], which makes all mutations of a single key linearizable.
//!
//! # Revisions
//!
//! Revisions are allocated from a store-wide counter, so a key that is
//! deleted and re-created never reuses an earlier revision. A caller holding
//! a revision from a previous incarnation of the key therefore always loses
//! its compare-and-swap.
//!
//! # Example
//!
//! ```
//! use opledger::store::{KvStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let rev = store.compare_and_swap("ops/a", None, "{}").unwrap();
//! let entry = store.get("ops/a").unwrap().unwrap();
//! assert_eq!(entry.revision, rev);
//!
//! // A second create-only write loses the race
//! assert!(store.compare_and_swap("ops/a", None, "{}").is_err());
//! ```

use thiserror::Error;

use crate::core::types::Revision;

/// Render an optional revision for error messages.
fn show(rev: &Option<Revision>) -> String {
    match rev {
        Some(r) => r.to_string(),
        None => "absent".to_string(),
    }
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No value exists for the key.
    #[error("key not found: {0}")]
    NotFound(String),

    /// CAS precondition failed - the key changed since it was read.
    #[error("CAS precondition failed for {key}: expected {}, found {}", show(.expected), show(.actual))]
    CasFailed {
        /// The key being written.
        key: String,
        /// The revision the caller expected.
        expected: Option<Revision>,
        /// The revision actually stored.
        actual: Option<Revision>,
    },

    /// The key cannot be represented by this store.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A stored value could not be decoded.
    #[error("corrupt entry at {key}: {message}")]
    Corrupt {
        /// The key holding the damaged entry.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// The store's internal lock could not be taken.
    #[error("store lock failed: {0}")]
    Lock(String),

    /// I/O error in a persistent store.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error is a lost compare-and-swap race.
    pub fn is_cas_failure(&self) -> bool {
        matches!(self, StoreError::CasFailed { .. })
    }
}

/// A value read from the store together with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Revision of the stored value; pass to `compare_and_swap` to update.
    pub revision: Revision,
    /// The stored JSON document.
    pub value: String,
}

/// Trait for the ledger's key-value persistence.
///
/// Implementations must be thread-safe (Send + Sync) and must hold their
/// internal lock only for a single read-check-write.
pub trait KvStore: Send + Sync {
    /// Read a key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `value` if the key's current revision equals `expected`.
    ///
    /// Pass `None` to create a key that must not exist yet. Returns the new
    /// revision.
    ///
    /// # Errors
    ///
    /// [`StoreError::CasFailed`] if the stored revision differs.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: &str,
    ) -> Result<Revision, StoreError>;

    /// Delete a key.
    ///
    /// With `expected = Some(rev)` the delete only happens if the stored
    /// revision equals `rev`; with `None` it is unconditional.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the key does not exist
    /// - [`StoreError::CasFailed`] if the stored revision differs
    fn delete(&self, key: &str, expected: Option<Revision>) -> Result<(), StoreError>;

    /// List all keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Check if a key exists.
    ///
    /// Default implementation uses `get()` and checks for `Some`.
    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = StoreError::NotFound("ops/a".into());
        assert!(err.to_string().contains("ops/a"));

        let err = StoreError::CasFailed {
            key: "ops/a".into(),
            expected: Some(Revision::new(2)),
            actual: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("CAS"));
        assert!(msg.contains("r2"));
        assert!(msg.contains("absent"));
        assert!(err.is_cas_failure());

        let err = StoreError::Corrupt {
            key: "ops/b".into(),
            message: "bad json".into(),
        };
        assert!(err.to_string().contains("bad json"));
        assert!(!err.is_cas_failure());
    }
}
