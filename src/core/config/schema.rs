//! core::config::schema
//!
//! Configuration schema types.
//!
//! # Validation
//!
//! Values are validated after parsing: retry and depth limits must be at
//! least one, and the log filter must not be blank.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Default number of compare-and-swap attempts before giving up.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 5;
/// Default bound on child-operation nesting.
pub const DEFAULT_MAX_LINK_DEPTH: usize = 8;
/// Default age, in seconds, after which a pending operation counts as stale.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 3600;

/// Ledger configuration.
///
/// # Example
///
/// ```toml
/// store_dir = "/var/lib/opledger"
/// max_cas_retries = 5
/// max_link_depth = 8
/// stale_after_secs = 3600
/// log_filter = "opledger=info"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Root directory of the file-backed store.
    pub store_dir: Option<PathBuf>,

    /// Attempts for read-modify-write loops that lose a CAS race.
    pub max_cas_retries: u32,

    /// Maximum depth of nested child operations.
    pub max_link_depth: usize,

    /// Age after which an operation is reported as stale.
    pub stale_after_secs: u64,

    /// `tracing` filter directive used by the CLI.
    pub log_filter: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
            max_link_depth: DEFAULT_MAX_LINK_DEPTH,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            log_filter: None,
        }
    }
}

impl LedgerConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cas_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "max_cas_retries must be at least 1".into(),
            ));
        }
        if self.max_link_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "max_link_depth must be at least 1".into(),
            ));
        }
        if let Some(filter) = &self.log_filter {
            if filter.trim().is_empty() {
                return Err(ConfigError::InvalidValue("log_filter cannot be blank".into()));
            }
        }
        if let Some(dir) = &self.store_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue("store_dir cannot be empty".into()));
            }
        }
        Ok(())
    }

    /// Stale threshold as a chrono duration.
    pub fn stale_after(&self) -> chrono::Duration {
        // chrono caps durations at i64::MAX milliseconds.
        let secs = self.stale_after_secs.min((i64::MAX / 1000) as u64);
        chrono::Duration::seconds(secs as i64)
    }
}
