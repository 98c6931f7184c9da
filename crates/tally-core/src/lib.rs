//! Tally Core Library
//!
//! This crate provides the core functionality for Tally, a local drink
//! check-in log that is ready to be merged across devices.
//!
//! # Architecture
//!
//! - **SQLite**: primary table of current record versions plus an
//!   append-only operation log, written together in one transaction
//! - **Single writer**: all writes go through one ordered queue; reads run
//!   on WAL snapshots in parallel
//! - **Change bus**: one wake-up signal per commit; consumers re-query with
//!   their token
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open()?;
//!
//! // Add a check-in
//! let model = Model::new(store.site_id(), Utc::now(), Drink::default());
//! let saved = store.save(model).await?;
//!
//! // Query a week
//! let (models, token) = store.get_models(monday, next_monday, None).await?;
//! ```
//!
//! # Modules
//!
//! - `store`: Query/token protocol (main entry point)
//! - `models`: Check-ins, drinks, record metadata
//! - `id`: Site-scoped global identifiers
//! - `lamport`: Per-column counters and conflict resolution
//! - `record`: Persisted row versions
//! - `storage`: Engine, schema, and operation log
//! - `notify`: Change notification bus
//! - `observer`: Cached, refreshable range queries
//! - `config`: Application configuration

pub mod config;
pub mod id;
pub mod identity;
pub mod lamport;
pub mod models;
pub mod notify;
pub mod observer;
pub mod record;
pub mod storage;
pub mod store;

pub use config::Config;
pub use id::{GlobalId, IdError, SiteId, MAX_OPERATION_INDEX, WILDCARD_INDEX};
pub use identity::{Identity, InitResult};
pub use lamport::{LamportCounter, LamportValue};
pub use models::{CheckIn, Drink, DrinkStyle, Metadata, Model, RecordState, UntappdId};
pub use notify::{ChangeBus, DataDidChange, TransactionObserver};
pub use observer::RangeObserver;
pub use record::RecordRow;
pub use storage::{LogEntry, StorageError, StorageResult, Token, TokenError};
pub use store::{LogMismatch, Store, StoreStats};
