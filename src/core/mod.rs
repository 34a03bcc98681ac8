//! core
//!
//! Core domain types, tables, and records for the ledger.
//!
//! # Modules
//!
//! - [`types`] - Strong types: OpId, EntityId, Revision, UtcTimestamp
//! - [`kinds`] - Operation and change kinds with their name tables
//! - [`delta`] - Actions and their typed payloads
//! - [`ops`] - Pending-operation records and entity enrollment
//! - [`config`] - Configuration schema and loading
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at compile time
//! - Persisted records are strict and self-describing
//! - Name lookups are total and never fail

pub mod config;
pub mod delta;
pub mod kinds;
pub mod ops;
pub mod types;
