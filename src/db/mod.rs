//! Event Store: SQLite persistence for outbox events and domain records.
//!
//! This module is split into two submodules:
//! - `model`: row decoding (strict and lenient) plus the filters shared by the
//!   SQL path and the in-memory fallback path.
//! - `repo`: SQL-only functions. Nothing outside `db` issues SQL directly.
//!
//! External modules should import from `lume_sync::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{EventFilter, EventOrder, RecordFilter, StatusSelector, StoredRow};
