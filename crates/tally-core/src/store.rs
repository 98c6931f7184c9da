//! Unified storage interface
//!
//! The `Store` is the surface the rest of the application uses:
//! - range queries that hand back a log token alongside the models
//! - saves that finalize identities and version Lamport columns
//! - the operation log as a change feed
//! - a change bus to learn when to re-query
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open()?;
//!
//! let (models, token) = store.get_models(from, to, None).await?;
//! let saved = store.save(Model::new(store.site_id(), Utc::now(), drink)).await?;
//!
//! let mut changes = store.subscribe();
//! changes.recv().await?;
//! let (models, token) = store.get_models(from, to, Some(&token)).await?;
//! ```
//!
//! The store keeps no state between calls beyond the database itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::config::Config;
use crate::id::{GlobalId, SiteId};
use crate::identity::Identity;
use crate::models::Model;
use crate::notify::{ChangeBus, DataDidChange, TransactionObserver};
use crate::record::RecordRow;
use crate::storage::{oplog, records};
use crate::storage::{LogEntry, StorageEngine, StorageError, StorageResult, Token};

/// Unified storage interface for Tally
pub struct Store {
    engine: StorageEngine,
    bus: ChangeBus,
    site_id: SiteId,
    config: Config,
}

/// Store statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Records in the primary table, tombstones included
    pub records: i64,
    pub tombstones: i64,
    pub log_entries: i64,
    pub token: Token,
}

/// A record whose primary-table row disagrees with its replayed log
#[derive(Debug, Clone, PartialEq)]
pub struct LogMismatch {
    pub id: GlobalId,
    pub stored: Option<RecordRow>,
    pub replayed: Option<RecordRow>,
}

impl Store {
    /// Open the store with the default configuration
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open the store with a specific configuration
    ///
    /// Creates this device's site identity on first use.
    pub fn open_with_config(config: Config) -> Result<Self> {
        let site_id = Identity::with_config(config.clone())
            .load_or_create()
            .context("Failed to load site identity")?;
        Self::open_with_site(config, site_id).context("Failed to open check-in store")
    }

    /// Open the store as `site_id`
    ///
    /// Errors here are fatal; see [`StorageError::is_fatal`].
    pub fn open_with_site(config: Config, site_id: SiteId) -> StorageResult<Self> {
        let bus = ChangeBus::new(config.notify_capacity);
        let observers: Vec<Arc<dyn TransactionObserver>> = vec![Arc::new(bus.clone())];
        let engine =
            StorageEngine::open(config.sqlite_path(), config.engine_options(), observers)?;

        info!(site = %site_id, "Store ready");
        Ok(Self {
            engine,
            bus,
            site_id,
            config,
        })
    }

    /// Site that owns records created by this store
    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to commit notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DataDidChange> {
        self.bus.subscribe()
    }

    // ==================== Queries ====================

    /// Live records with `from <= time < to`, plus a token for the log tail
    ///
    /// Always a full range scan; `token` only tells us what the caller last
    /// saw. Ordered by check-in time, ties by ID.
    pub async fn get_models(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        token: Option<&Token>,
    ) -> StorageResult<(Vec<Model>, Token)> {
        self.range(from, to, token, false).await
    }

    /// Like [`Store::get_models`], tombstones included
    pub async fn get_models_including_deleted(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        token: Option<&Token>,
    ) -> StorageResult<(Vec<Model>, Token)> {
        self.range(from, to, token, true).await
    }

    async fn range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        token: Option<&Token>,
        include_deleted: bool,
    ) -> StorageResult<(Vec<Model>, Token)> {
        if from > to {
            return Err(StorageError::InvalidInput(format!(
                "Range start {} is after its end {}",
                from, to
            )));
        }

        let seen = token.copied();
        self.engine
            .read_transaction(move |tx| {
                let rows = records::in_range(tx, from, to, include_deleted)?;
                let tail = oplog::tail(tx)?;
                if seen.is_some_and(|t| t == tail) {
                    trace!(token = %tail, "Range re-scanned on an unchanged log");
                }
                let models = rows.into_iter().map(RecordRow::into_model).collect();
                Ok((models, tail))
            })
            .await
    }

    /// Most recently created live record
    pub async fn get_last_added_model(&self) -> StorageResult<Option<Model>> {
        self.engine
            .read_transaction(|tx| Ok(records::last_added(tx)?.map(RecordRow::into_model)))
            .await
    }

    /// Get a record by ID, tombstoned or not
    pub async fn get_model(&self, id: GlobalId) -> StorageResult<Option<Model>> {
        self.engine
            .read_transaction(move |tx| Ok(records::get(tx, &id)?.map(RecordRow::into_model)))
            .await
    }

    // ==================== Writes ====================

    /// Persist a model and return it as stored
    ///
    /// A wildcard ID is finalized in the same transaction. Only columns whose
    /// value changed get a new counter. Saving `deleted = true` tombstones the
    /// record; nothing is ever removed.
    pub async fn save(&self, model: Model) -> StorageResult<Model> {
        let id = model.id();
        self.save_all(vec![model])
            .await?
            .pop()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Persist several models as one action
    ///
    /// One transaction, one action ID, one change notification.
    pub async fn save_all(&self, models: Vec<Model>) -> StorageResult<Vec<Model>> {
        if models.is_empty() {
            return Ok(Vec::new());
        }
        for model in &models {
            self.check(model)?;
        }

        let site = self.site_id;
        self.engine
            .read_write_transaction(move |tx| {
                let mut rows = Vec::with_capacity(models.len());
                for model in &models {
                    let row = next_version(tx, model, site)?;
                    records::upsert(tx, &row)?;
                    rows.push(row);
                }
                oplog::append(tx, Uuid::new_v4(), site, &rows)?;
                debug!(records = rows.len(), "Saved check-ins");
                Ok(rows.into_iter().map(RecordRow::into_model).collect())
            })
            .await
    }

    /// Tombstone a record
    pub async fn delete(&self, id: GlobalId) -> StorageResult<Model> {
        self.set_deleted(id, true).await
    }

    /// Clear a record's tombstone
    pub async fn restore(&self, id: GlobalId) -> StorageResult<Model> {
        self.set_deleted(id, false).await
    }

    async fn set_deleted(&self, id: GlobalId, deleted: bool) -> StorageResult<Model> {
        let site = self.site_id;
        self.engine
            .read_write_transaction(move |tx| {
                let current =
                    records::get(tx, &id)?.ok_or_else(|| StorageError::NotFound(id.to_string()))?;

                let mut model = current.to_model();
                model.metadata.deleted = deleted;
                let row = current.next_version(&model, site);

                records::upsert(tx, &row)?;
                oplog::append(tx, Uuid::new_v4(), site, std::slice::from_ref(&row))?;
                Ok(row.into_model())
            })
            .await
    }

    fn check(&self, model: &Model) -> StorageResult<()> {
        model
            .check_in
            .drink
            .validate()
            .map_err(StorageError::InvalidInput)?;

        let id = model.id();
        if id.is_wildcard() && id.site_id != self.site_id {
            return Err(StorageError::InvalidInput(format!(
                "Cannot create a record for site {} from site {}",
                id.site_id, self.site_id
            )));
        }
        Ok(())
    }

    // ==================== Operation log ====================

    /// Log entries committed after `token`, plus a token for the new tail
    ///
    /// A `None`, foreign, or out-of-range token returns the whole log.
    pub async fn entries_since(
        &self,
        token: Option<&Token>,
    ) -> StorageResult<(Vec<LogEntry>, Token)> {
        let token = token.copied();
        self.engine
            .read_transaction(move |tx| oplog::entries_since(tx, token.as_ref()))
            .await
    }

    /// Apply log entries produced by another replica
    ///
    /// Each entry is merged field by field into the local row; equal counters
    /// go to the site that wrote the column, whichever replica merges. Rows
    /// that end up unchanged are skipped. Returns the number of rows written.
    ///
    /// Every entry is checked first: its ID must be one a store could have
    /// assigned and its drink must pass the same validation as a save.
    pub async fn merge_entries(&self, entries: Vec<LogEntry>) -> StorageResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        for entry in &entries {
            check_entry(entry)?;
        }

        let site = self.site_id;
        self.engine
            .read_write_transaction(move |tx| {
                let mut changed = Vec::new();
                for entry in entries {
                    let merged = match records::get(tx, &entry.record_id)? {
                        Some(local) => {
                            let merged = local.clone().merge(entry.payload);
                            if merged == local {
                                continue;
                            }
                            debug!(
                                id = %merged.id,
                                columns = ?merged.changed_columns(&local),
                                "Merged remote edits"
                            );
                            merged
                        }
                        None => entry.payload,
                    };
                    records::upsert(tx, &merged)?;
                    changed.push(merged);
                }

                if !changed.is_empty() {
                    oplog::append(tx, Uuid::new_v4(), site, &changed)?;
                }
                info!(rows = changed.len(), "Merged remote log entries");
                Ok(changed.len())
            })
            .await
    }

    /// Replay the whole log and compare it with the primary table
    ///
    /// Returns every record where the two disagree; empty means consistent.
    pub async fn verify_log(&self) -> StorageResult<Vec<LogMismatch>> {
        self.engine
            .read_transaction(|tx| {
                let (entries, _) = oplog::entries_since(tx, None)?;
                let replayed = oplog::replay(&entries);
                let stored: std::collections::BTreeMap<GlobalId, RecordRow> = records::all(tx)?
                    .into_iter()
                    .map(|row| (row.id, row))
                    .collect();

                let ids: BTreeSet<GlobalId> =
                    replayed.keys().chain(stored.keys()).copied().collect();
                let mismatches = ids
                    .into_iter()
                    .filter_map(|id| {
                        let stored = stored.get(&id);
                        let replayed = replayed.get(&id);
                        (stored != replayed).then(|| LogMismatch {
                            id,
                            stored: stored.cloned(),
                            replayed: replayed.cloned(),
                        })
                    })
                    .collect();
                Ok(mismatches)
            })
            .await
    }

    /// Get store statistics
    pub async fn stats(&self) -> StorageResult<StoreStats> {
        self.engine
            .read_transaction(|tx| {
                let (records, tombstones) = records::counts(tx)?;
                Ok(StoreStats {
                    records,
                    tombstones,
                    log_entries: oplog::len(tx)?,
                    token: oplog::tail(tx)?,
                })
            })
            .await
    }
}

/// The row version that `site` saving `model` produces
///
/// Must run inside the write transaction that stores it.
fn next_version(
    conn: &rusqlite::Connection,
    model: &Model,
    site: SiteId,
) -> StorageResult<RecordRow> {
    let id = model.id();
    if id.is_wildcard() {
        let index = records::next_operation_index(conn, &id.site_id)?;
        let id = id.finalize(index)?;
        debug!(id = %id, "Finalized record identity");
        return Ok(RecordRow::first_version(id, model, site));
    }

    Ok(match records::get(conn, &id)? {
        Some(current) => current.next_version(model, site),
        None => RecordRow::first_version(id, model, site),
    })
}

/// Reject a log entry no store could have committed
fn check_entry(entry: &LogEntry) -> StorageResult<()> {
    let id = entry.record_id;
    if id.is_wildcard() || entry.payload.id != id {
        return Err(StorageError::InvalidInput(format!(
            "Log entry {} does not describe a committed record",
            entry.position
        )));
    }
    if !id.is_assignable() {
        return Err(StorageError::InvalidInput(format!(
            "Log entry {} uses reserved index {}",
            entry.position, id.operation_index
        )));
    }
    entry.payload.validate().map_err(|e| {
        StorageError::InvalidInput(format!("Log entry {} for {}: {}", entry.position, id, e))
    })
}
