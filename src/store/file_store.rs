//! store::file_store
//!
//! Directory-backed key-value store.
//!
//! # Layout
//!
//! - `<root>/<key>.json` - One file per key; `/` in keys maps to directories
//! - `<root>/.revision` - Store-wide revision counter
//! - `<root>/.lock` - Lock file serializing writers across processes
//!
//! Each entry file holds an envelope `{"revision": n, "value": {...}}`.
//!
//! # Atomicity
//!
//! Writers take an exclusive OS-level lock (via `fs2`) on `.lock` for the
//! duration of one read-check-write. Files are replaced by writing a temp
//! file, syncing it, and renaming it over the target, so readers never see
//! a torn entry and do not need the lock.
//!
//! # Example
//!
//! ```no_run
//! use opledger::store::{FileStore, KvStore};
//! use std::path::PathBuf;
//!
//! let store = FileStore::open(PathBuf::from("/var/lib/opledger")).unwrap();
//! let rev = store.compare_and_swap("ops/abc", None, r#"{"kind":"create_volume"}"#).unwrap();
//! println!("stored at {}", rev);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::traits::{KvStore, StoreError, Versioned};
use crate::core::types::Revision;

const LOCK_FILE: &str = ".lock";
const REVISION_FILE: &str = ".revision";
const ENTRY_EXT: &str = "json";

/// On-disk form of one entry.
#[derive(Serialize, Deserialize)]
struct Envelope {
    revision: Revision,
    value: serde_json::Value,
}

/// Key-value store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Exclusive writer lock, released on drop.
struct WriterLock {
    file: File,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well.
        let _ = self.file.unlock();
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its entry file.
    fn entry_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        let segments: Vec<&str> = key.split('/').collect();
        for segment in &segments {
            if segment.is_empty() || segment.starts_with('.') || segment.contains('\\') {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
        }
        let (last, dirs) = segments
            .split_last()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{}.{}", last, ENTRY_EXT));
        Ok(path)
    }

    fn acquire(&self) -> Result<WriterLock, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(WriterLock { file })
    }

    fn read_entry(&self, key: &str, path: &Path) -> Result<Option<Envelope>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Allocate the next store-wide revision. Caller holds the writer lock.
    fn allocate_revision(&self) -> Result<Revision, StoreError> {
        let path = self.root.join(REVISION_FILE);
        let last = match fs::read_to_string(&path) {
            Ok(c) => c.trim().parse::<u64>().map_err(|e| StoreError::Corrupt {
                key: REVISION_FILE.to_string(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let next = Revision::new(last + 1);
        write_atomic(&path, next.get().to_string().as_bytes())?;
        Ok(next)
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, &format!("{}{}/", prefix, name), keys)?;
            } else if let Some(stem) = name.strip_suffix(&format!(".{}", ENTRY_EXT)) {
                keys.push(format!("{}{}", prefix, stem));
            }
        }
        Ok(())
    }
}

/// Write a file atomically: temp file, fsync, rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let path = self.entry_path(key)?;
        Ok(self.read_entry(key, &path)?.map(|env| Versioned {
            revision: env.revision,
            value: env.value.to_string(),
        }))
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

        let path = self.entry_path(key)?;
        let value: serde_json::Value =
            serde_json::from_str(value).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                message: format!("value is not JSON: {}", e),
            })?;

        let _lock = self.acquire()?;
        let actual = self.read_entry(key, &path)?.map(|env| env.revision);
        if actual != expected {
            return Err(StoreError::CasFailed {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let revision = self.allocate_revision()?;
        let content = serde_json::to_string_pretty(&Envelope { revision, value }).map_err(|e| {
            StoreError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }
        })?;
        write_atomic(&path, content.as_bytes())?;
        Ok(revision)
    }

    fn delete(&self, key: &str, expected: Option<Revision>) -> Result<(), StoreError> {
        #[cfg(any(test, feature = "fault_injection"))]
        if super::fault_injection::should_crash() {
            return Err(super::fault_injection::simulated_crash());
        }

        let path = self.entry_path(key)?;
        let _lock = self.acquire()?;
        let actual = match self.read_entry(key, &path)? {
            Some(env) => env.revision,
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
        fs::remove_file(&path)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
