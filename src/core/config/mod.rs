//! core::config
//!
//! Configuration schema and loading.
//!
//! # Precedence
//!
//! Configuration values are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. Config file
//! 3. CLI flags (not handled here)
//!
//! # Config Locations
//!
//! Searched in order:
//! 1. `$OPLEDGER_CONFIG` if set
//! 2. `$XDG_CONFIG_HOME/opledger/config.toml`
//! 3. `~/.opledger/config.toml`
//!
//! # Example
//!
//! ```no_run
//! use opledger::core::config::Config;
//!
//! let config = Config::load().unwrap();
//! println!("retries: {}", config.ledger.max_cas_retries);
//! if let Some(path) = config.loaded_from() {
//!     println!("from {}", path.display());
//! }
//! ```

pub mod schema;

pub use schema::LedgerConfig;

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "OPLEDGER_CONFIG";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Ledger settings.
    pub ledger: LedgerConfig,
    /// File the settings were read from, if any.
    path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed or
    /// holds invalid values. A missing file is not an error.
    pub fn load() -> Result<Config, ConfigError> {
        let located = locate(
            std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
            dirs::home_dir(),
        );
        match located {
            Some(path) => Self::load_from(&path),
            None => Ok(Config::default()),
        }
    }

    /// Load configuration from an explicit file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if its
    /// values fail validation.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let ledger: LedgerConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        ledger.validate()?;
        Ok(Config {
            ledger,
            path: Some(path.to_path_buf()),
        })
    }

    /// Path the config was loaded from, if a file was found.
    pub fn loaded_from(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Pick the first existing config file in search order.
fn locate(
    explicit: Option<PathBuf>,
    xdg_home: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    let candidates = [
        explicit,
        xdg_home.map(|p| p.join("opledger/config.toml")),
        home.map(|p| p.join(".opledger/config.toml")),
    ];
    candidates.into_iter().flatten().find(|p| p.exists())
}
