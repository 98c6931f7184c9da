//! Storage engine adapter
//!
//! Owns the SQLite database and hands out transactions:
//!
//! - **Writes** go through a bounded FIFO queue drained by one dedicated
//!   writer thread that owns the only read-write connection. At most one write
//!   transaction is in flight, and log order equals submission order.
//! - **Reads** run on the blocking pool against an r2d2 pool of read-only
//!   connections. WAL mode gives each read transaction a consistent snapshot
//!   without blocking the writer or other readers.
//!
//! Both return `StorageResult`; a failed block rolls its transaction back, so
//! the primary table and the operation log never diverge.
//!
//! The writer is a plain thread rather than a pooled connection: its queue is
//! bounded by `write_queue_depth`, and observers run on it between commit and
//! the reply to the submitter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, stored_version, SCHEMA_VERSION};
use crate::notify::TransactionObserver;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Observers = Vec<Arc<dyn TransactionObserver>>;
type WriteJob = Box<dyn FnOnce(&mut Connection, &[Arc<dyn TransactionObserver>]) + Send>;

/// Engine tuning
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Writes that may wait in the queue before submitters are held back
    pub write_queue_depth: usize,
    /// Read-only connections the pool may hold
    pub read_pool_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            write_queue_depth: 64,
            read_pool_size: 4,
        }
    }
}

/// Handle to the open database
pub struct StorageEngine {
    path: PathBuf,
    log_id: Uuid,
    writer: mpsc::Sender<WriteJob>,
    readers: Pool<SqliteConnectionManager>,
}

impl StorageEngine {
    /// Open (creating if needed) the database at `path` and initialize it
    ///
    /// Observers are registered with the writer and run after every write
    /// transaction. A file written by a different schema version is refused.
    /// Any error here is fatal for the store.
    pub fn open(
        path: impl AsRef<Path>,
        options: EngineOptions,
        observers: Observers,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut conn = Connection::open(&path).map_err(|e| StorageError::open(&path, e))?;
        configure(&conn).map_err(|e| StorageError::open(&path, e))?;
        match stored_version(&conn).map_err(|e| StorageError::open(&path, e))? {
            Some(found) if found != SCHEMA_VERSION => {
                return Err(StorageError::UnsupportedSchema {
                    path,
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
            _ => {}
        }
        let log_id = init_schema(&mut conn).map_err(|e| StorageError::open(&path, e))?;

        let readers = read_pool(&path, options.read_pool_size)?;

        let (writer, jobs) = mpsc::channel(options.write_queue_depth.max(1));
        spawn_writer(conn, jobs, observers)?;

        info!(path = %path.display(), log_id = %log_id, "Opened check-in store");

        Ok(Self {
            path,
            log_id,
            writer,
            readers,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity of this database's operation log
    pub fn log_id(&self) -> &Uuid {
        &self.log_id
    }

    /// Run `block` inside a read-only snapshot
    pub async fn read_transaction<T, F>(&self, block: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> StorageResult<T> + Send + 'static,
    {
        let readers = self.readers.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = readers.get()?;
            run_read(&mut conn, block)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))
        .and_then(|result| result);

        if let Err(e) = &result {
            warn!(error = %e, "Read transaction failed");
        }
        result
    }

    /// Queue `block` to run inside a write transaction
    ///
    /// Jobs run one at a time in submission order. The transaction commits
    /// when `block` returns `Ok` and rolls back otherwise.
    pub async fn read_write_transaction<T, F>(&self, block: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> StorageResult<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |conn, observers| {
            let result = run_write(conn, observers, block);
            // The caller may have gone away; the write stands regardless
            let _ = reply_tx.send(result);
        });

        self.writer
            .send(job)
            .await
            .map_err(|_| StorageError::WriterClosed)?;

        let result = reply_rx.await.map_err(|_| StorageError::WriterClosed)?;
        if let Err(e) = &result {
            warn!(error = %e, "Write transaction failed");
        }
        result
    }
}

/// Pragmas for the read-write connection
fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Read-only connections, opened lazily
///
/// The schema must already exist: read-only handles cannot create it.
fn read_pool(path: &Path, size: usize) -> StorageResult<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path)
        .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .with_init(|conn| conn.busy_timeout(BUSY_TIMEOUT));

    let max_size = u32::try_from(size.max(1)).unwrap_or(u32::MAX);
    let pool = Pool::builder()
        .max_size(max_size)
        .min_idle(Some(0))
        .build(manager)?;
    debug!(max_size, "Read pool ready");
    Ok(pool)
}

fn spawn_writer(
    mut conn: Connection,
    mut jobs: mpsc::Receiver<WriteJob>,
    observers: Observers,
) -> StorageResult<()> {
    thread::Builder::new()
        .name("tally-writer".to_string())
        .spawn(move || {
            while let Some(job) = jobs.blocking_recv() {
                job(&mut conn, &observers);
            }
            debug!("Write queue closed, writer exiting");
        })?;
    Ok(())
}

fn run_write<T, F>(
    conn: &mut Connection,
    observers: &[Arc<dyn TransactionObserver>],
    block: F,
) -> StorageResult<T>
where
    F: FnOnce(&Transaction<'_>) -> StorageResult<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    match block(&tx) {
        Ok(value) => {
            if let Err(e) = tx.commit() {
                observers.iter().for_each(|o| o.did_rollback());
                return Err(e.into());
            }
            debug!("Write transaction committed");
            observers.iter().for_each(|o| o.did_commit());
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback() {
                warn!(error = %rollback, "Rollback failed");
            }
            observers.iter().for_each(|o| o.did_rollback());
            Err(e)
        }
    }
}

fn run_read<T, F>(conn: &mut Connection, block: F) -> StorageResult<T>
where
    F: FnOnce(&Transaction<'_>) -> StorageResult<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
    let result = block(&tx);
    // Read-only; ending the snapshot is all that is needed
    tx.finish()?;
    result
}
