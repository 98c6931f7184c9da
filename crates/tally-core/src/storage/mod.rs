//! Storage layer
//!
//! SQLite holds both the current version of every record and the operation
//! log that produced it.
//!
//! ## Architecture
//!
//! - **engine**: single ordered writer plus snapshot readers
//! - **records**: primary table row mapping
//! - **oplog**: append-only change feed and tokens
//!
//! A write transaction updates the primary table and appends to the log
//! together, so the two never disagree.

pub mod engine;
pub mod error;
pub mod oplog;
pub mod records;
pub mod schema;

pub use engine::{EngineOptions, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use oplog::{LogEntry, Token, TokenError};
pub use schema::{init_schema, stored_version, SCHEMA_VERSION};
