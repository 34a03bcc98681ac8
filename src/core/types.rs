//! core::types
//!
//! Strong types used throughout the ledger.
//!
//! # Types
//!
//! - [`OpId`] - Globally unique pending-operation identifier
//! - [`EntityId`] - Identifier of a managed entity (brick, volume, ...)
//! - [`Revision`] - Store revision used for compare-and-swap
//! - [`UtcTimestamp`] - RFC3339 timestamp
//!
//! # Validation
//!
//! Identifiers are validated at construction time so that every value can
//! be used verbatim as a store key component. Invalid values cannot be
//! represented.
//!
//! # Examples
//!
//! ```
//! use opledger::core::types::{EntityId, OpId};
//!
//! let entity = EntityId::new("vol-1").unwrap();
//! assert_eq!(entity.as_str(), "vol-1");
//!
//! assert!(EntityId::new("").is_err());
//! assert!(EntityId::new("a/b").is_err());
//!
//! let a = OpId::new();
//! let b = OpId::new();
//! assert_ne!(a, b);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("invalid operation id: {0}")]
    InvalidOpId(String),
}

/// Validate an identifier that will be embedded in a store key.
///
/// Keys use `/` as a separator, so identifiers may not contain it. Leading
/// dots are rejected so the directory-backed store never produces hidden or
/// relative path components.
fn validate_key_component(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("cannot be empty".into());
    }
    if id.starts_with('.') {
        return Err("cannot start with '.'".into());
    }
    if id.contains('/') || id.contains('\\') {
        return Err("cannot contain path separators".into());
    }
    if id.chars().any(|c| c.is_ascii_control() || c.is_whitespace()) {
        return Err("cannot contain whitespace or control characters".into());
    }
    Ok(())
}

/// Unique identifier for a pending operation.
///
/// Fresh identifiers are UUID v4 strings. Identifiers read back from the
/// store go through [`OpId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpId(String);

impl OpId {
    /// Generate a new unique operation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse an operation id from an existing string.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidOpId` if the string cannot be used as a
    /// store key component.
    pub fn parse(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        validate_key_component(&s).map_err(|e| TypeError::InvalidOpId(format!("'{}' {}", s, e)))?;
        Ok(Self(s))
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for OpId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<OpId> for String {
    fn from(id: OpId) -> Self {
        id.0
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a managed entity.
///
/// Entity ids are assigned by the surrounding orchestrator and are unique
/// across entity kinds, which lets a single pending marker namespace cover
/// bricks, volumes, block volumes, and devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Create a new validated entity id.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidEntityId` if the id is empty or contains
    /// characters that cannot appear in a store key.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        validate_key_component(&id)
            .map_err(|e| TypeError::InvalidEntityId(format!("'{}' {}", id, e)))?;
        Ok(Self(id))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl From<&OpId> for EntityId {
    /// Operation links name the linked operation in the entity slot.
    fn from(id: &OpId) -> Self {
        Self(id.0.clone())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A store revision.
///
/// Every successful write to a key yields a strictly larger revision for
/// that key. Compare-and-swap callers pass the revision they read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    /// The revision assigned to a freshly created key.
    pub const FIRST: Revision = Revision(1);

    /// Wrap a raw revision number.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The revision following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Raw revision number.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A UTC timestamp.
///
/// Serializes as RFC3339.
///
/// # Example
///
/// ```
/// use opledger::core::types::UtcTimestamp;
///
/// let now = UtcTimestamp::now();
/// println!("Current time: {}", now);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(chrono::DateTime<chrono::Utc>);

impl UtcTimestamp {
    /// Create a timestamp for the current moment.
    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    /// Create a timestamp from a chrono DateTime.
    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self(dt)
    }

    /// Get the underlying datetime.
    pub fn as_datetime(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }

    /// Time elapsed between this timestamp and `now`.
    ///
    /// Clock skew that would make the result negative yields zero.
    pub fn age_at(&self, now: &UtcTimestamp) -> chrono::Duration {
        let age = now.0 - self.0;
        if age < chrono::Duration::zero() {
            chrono::Duration::zero()
        } else {
            age
        }
    }
}

impl std::fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod op_id {
        use super::*;

        #[test]
        fn new_generates_unique_ids() {
            let id1 = OpId::new();
            let id2 = OpId::new();
            assert_ne!(id1, id2);
        }

        #[test]
        fn parse_roundtrip() {
            let original = OpId::new();
            let recreated = OpId::parse(original.as_str()).unwrap();
            assert_eq!(original, recreated);
        }

        #[test]
        fn parse_rejects_separator() {
            assert!(matches!(
                OpId::parse("a/b"),
                Err(TypeError::InvalidOpId(_))
            ));
        }

        #[test]
        fn serde_rejects_invalid() {
            let result: Result<OpId, _> = serde_json::from_str("\"\"");
            assert!(result.is_err());
        }

        #[test]
        fn display_formatting() {
            let id = OpId::parse("test-id").unwrap();
            assert_eq!(format!("{}", id), "test-id");
        }
    }

    mod entity_id {
        use super::*;

        #[test]
        fn valid_ids() {
            assert!(EntityId::new("brick-1").is_ok());
            assert!(EntityId::new("3f2a9c1e0b7d4e6f8a1b2c3d4e5f6a7b").is_ok());
        }

        #[test]
        fn invalid_ids() {
            assert!(EntityId::new("").is_err());
            assert!(EntityId::new(".hidden").is_err());
            assert!(EntityId::new("a/b").is_err());
            assert!(EntityId::new("a b").is_err());
            assert!(EntityId::new("a\u{7}").is_err());
        }

        #[test]
        fn serde_roundtrip() {
            let id = EntityId::new("vol-2").unwrap();
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, "\"vol-2\"");
            let parsed: EntityId = serde_json::from_str(&json).unwrap();
            assert_eq!(id, parsed);
        }
    }

    mod revision {
        use super::*;

        #[test]
        fn next_is_strictly_greater() {
            let r = Revision::FIRST;
            assert!(r.next() > r);
            assert_eq!(r.next().get(), 2);
        }

        #[test]
        fn display() {
            assert_eq!(Revision::new(7).to_string(), "r7");
        }
    }

    mod timestamp {
        use super::*;

        #[test]
        fn age_is_never_negative() {
            let later = UtcTimestamp::now();
            let earlier =
                UtcTimestamp::from_datetime(*later.as_datetime() - chrono::Duration::seconds(30));
            assert_eq!(earlier.age_at(&later).num_seconds(), 30);
            assert_eq!(later.age_at(&earlier), chrono::Duration::zero());
        }
    }
}
