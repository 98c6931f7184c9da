//! Reactive range observer
//!
//! Holds one consumer's cached view of a time range together with the token
//! it was read at. On a change notification the consumer calls
//! [`RangeObserver::wait_and_refresh`] (or [`RangeObserver::refresh`] directly)
//! to re-query. Each consumer owns its observer; nothing is shared.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::models::Model;
use crate::notify::DataDidChange;
use crate::storage::{StorageResult, Token};
use crate::store::Store;

/// Cached query results for `[from, to)`
#[derive(Debug, Clone)]
pub struct RangeObserver {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    include_deleted: bool,
    token: Option<Token>,
    models: Vec<Model>,
}

impl RangeObserver {
    /// Observer over live records; nothing is loaded until the first refresh
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            include_deleted: false,
            token: None,
            models: Vec::new(),
        }
    }

    /// Include tombstoned records as well
    #[must_use]
    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    /// Token of the last refresh, `None` before the first one
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.from, self.to)
    }

    /// Re-query the range
    ///
    /// Returns whether the log moved since the previous refresh. The first
    /// refresh always counts as a change.
    pub async fn refresh(&mut self, store: &Store) -> StorageResult<bool> {
        let (models, token) = if self.include_deleted {
            store
                .get_models_including_deleted(self.from, self.to, self.token.as_ref())
                .await?
        } else {
            store
                .get_models(self.from, self.to, self.token.as_ref())
                .await?
        };

        let changed = self.token != Some(token);
        debug!(token = %token, changed, records = models.len(), "Refreshed range");
        self.models = models;
        self.token = Some(token);
        Ok(changed)
    }

    /// Wait for the next change notification, then refresh
    ///
    /// A lagged receiver still refreshes. Returns `Ok(false)` without
    /// querying once the bus has closed.
    pub async fn wait_and_refresh(
        &mut self,
        store: &Store,
        changes: &mut broadcast::Receiver<DataDidChange>,
    ) -> StorageResult<bool> {
        match changes.recv().await {
            Ok(DataDidChange) | Err(RecvError::Lagged(_)) => self.refresh(store).await,
            Err(RecvError::Closed) => Ok(false),
        }
    }
}
