//! SQLite schema for the check-in store
//!
//! - `checkins`: one row per record (current version), keyed by global ID
//! - `checkin_log`: append-only operation log, one entry per row version
//! - `schema_info`: schema version and the log's identity
//!
//! Each Lamport column is stored as `<col>_value`, `<col>_lamport` (counter)
//! and `<col>_site` (the site that wrote it).

use rusqlite::{Connection, OptionalExtension, Result};
use uuid::Uuid;

use crate::record::LAMPORT_COLUMNS;

/// Schema version written by this build
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// Idempotent: safe to run on every open. Returns the log ID, minting one the
/// first time the log is created.
pub fn init_schema(conn: &mut Connection) -> Result<Uuid> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        -- Schema version and log identity
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Current state of every record
        CREATE TABLE IF NOT EXISTS checkins (
            id_site TEXT NOT NULL,
            id_index INTEGER NOT NULL,
            creation_time INTEGER NOT NULL,
            deleted_value INTEGER NOT NULL,
            deleted_lamport INTEGER NOT NULL,
            deleted_site TEXT NOT NULL,
            untappd_id_value INTEGER,
            untappd_id_lamport INTEGER NOT NULL,
            untappd_id_site TEXT NOT NULL,
            time_value INTEGER NOT NULL,
            time_lamport INTEGER NOT NULL,
            time_site TEXT NOT NULL,
            name_value TEXT,
            name_lamport INTEGER NOT NULL,
            name_site TEXT NOT NULL,
            style_value TEXT NOT NULL,
            style_lamport INTEGER NOT NULL,
            style_site TEXT NOT NULL,
            abv_value REAL NOT NULL,
            abv_lamport INTEGER NOT NULL,
            abv_site TEXT NOT NULL,
            price_value REAL NOT NULL,
            price_lamport INTEGER NOT NULL,
            price_site TEXT NOT NULL,
            volume_value REAL NOT NULL,
            volume_lamport INTEGER NOT NULL,
            volume_site TEXT NOT NULL,
            PRIMARY KEY (id_site, id_index)
        ) WITHOUT ROWID;

        -- Range scans by check-in time
        CREATE INDEX IF NOT EXISTS idx_checkins_time ON checkins(time_value);

        -- Last added record
        CREATE INDEX IF NOT EXISTS idx_checkins_creation_time ON checkins(creation_time);

        -- Lookups by external reference, only for rows that have one
        CREATE INDEX IF NOT EXISTS idx_checkins_untappd_id ON checkins(untappd_id_value)
            WHERE untappd_id_value IS NOT NULL;

        -- Append-only log; position is never reused
        CREATE TABLE IF NOT EXISTS checkin_log (
            position INTEGER PRIMARY KEY AUTOINCREMENT,
            action_id TEXT NOT NULL,
            action_index INTEGER NOT NULL,
            author_site TEXT NOT NULL,
            record_site TEXT NOT NULL,
            record_index INTEGER NOT NULL,
            committed_at INTEGER NOT NULL,
            payload TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_checkin_log_action
            ON checkin_log(action_id, action_index);
        "#,
    )?;

    // "Most recent wins" lookups per Lamport column
    for column in LAMPORT_COLUMNS {
        tx.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS idx_checkins_{column}_lamport ON checkins({column}_lamport);"
        ))?;
    }

    tx.execute(
        "INSERT OR IGNORE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_info (key, value) VALUES ('log_id', ?)",
        [Uuid::new_v4().to_string()],
    )?;

    let log_id = read_log_id(&tx)?;
    tx.commit()?;
    Ok(log_id)
}

/// Get the identity of this database's operation log
pub fn read_log_id(conn: &Connection) -> Result<Uuid> {
    let value: String = conn.query_row(
        "SELECT value FROM schema_info WHERE key = 'log_id'",
        [],
        |row| row.get(0),
    )?;
    Uuid::parse_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Schema version recorded in the file, `None` for a fresh database
///
/// A version that is present but unreadable comes back as `Some(0)`, which
/// never matches [`SCHEMA_VERSION`].
pub fn stored_version(conn: &Connection) -> Result<Option<i32>> {
    let has_info = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'")?
        .exists([])?;
    if !has_info {
        return Ok(None);
    }

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.map(|v| v.parse().unwrap_or(0)))
}
