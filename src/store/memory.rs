//! store::memory
//!
//! In-process key-value store.
//!
//! Used by tests and by embedders that persist the ledger through some
//! other mechanism. All state lives behind one mutex, held for exactly one
//! read-check-write per call.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::{KvStore, StoreError, Versioned};
use crate::core::types::Revision;

/// In-memory store with store-wide revision numbering.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeMap<String, Versioned>,
    last_revision: u64,
}

impl MemoryInner {
    fn allocate(&mut self) -> Revision {
        self.last_revision += 1;
        Revision::new(self.last_revision)
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.lock()?.entries.get(key).cloned())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: &str,
    ) -> Result<Revision, StoreError> {
        #[cfg(any(test, feature = "fault_injection"))]
        if super::fault_injection::should_crash() {
            return Err(super::fault_injection::simulated_crash());
        }

        let mut inner = self.lock()?;
        let actual = inner.entries.get(key).map(|v| v.revision);
        if actual != expected {
            return Err(StoreError::CasFailed {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        let revision = inner.allocate();
        inner.entries.insert(
            key.to_string(),
            Versioned {
                revision,
                value: value.to_string(),
            },
        );
        Ok(revision)
    }

    fn delete(&self, key: &str, expected: Option<Revision>) -> Result<(), StoreError> {
        #[cfg(any(test, feature = "fault_injection"))]
        if super::fault_injection::should_crash() {
            return Err(super::fault_injection::simulated_crash());
        }

        let mut inner = self.lock()?;
        let actual = match inner.entries.get(key) {
            Some(v) => v.revision,
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        if let Some(expected) = expected {
            if expected != actual {
                return Err(StoreError::CasFailed {
                    key: key.to_string(),
                    expected: Some(expected),
                    actual: Some(actual),
                });
            }
        }
        inner.entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
