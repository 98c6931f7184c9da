//! Operation log
//!
//! Every committed write appends one entry per row version it produced, in the
//! same transaction as the primary-table change. Entries written by one
//! logical action share an `action_id` and carry a contiguous `action_index`
//! run starting at 0.
//!
//! A [`Token`] is a cursor over the log's append position. `None` means "no
//! prior observation"; tokens issued by a different log, or pointing past the
//! tail, are treated the same way.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::error::StorageResult;
use super::schema::read_log_id;
use crate::id::{GlobalId, SiteId};
use crate::record::RecordRow;

/// Errors parsing a token's text form
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Invalid token encoding: {0}")]
    Encoding(String),

    #[error("Invalid token length: expected 24 bytes, got {0}")]
    Length(usize),
}

/// Cursor over the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    log_id: Uuid,
    position: i64,
}

impl Token {
    pub(crate) const fn new(log_id: Uuid, position: i64) -> Self {
        Self { log_id, position }
    }

    /// Log this token was issued from
    pub const fn log_id(&self) -> &Uuid {
        &self.log_id
    }

    /// Last log position covered by this token
    pub const fn position(&self) -> i64 {
        self.position
    }

    /// Encode as base58check
    pub fn to_bs58check(&self) -> String {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(self.log_id.as_bytes());
        bytes.extend_from_slice(&self.position.to_be_bytes());
        bs58::encode(bytes).with_check().into_string()
    }

    /// Decode from base58check
    pub fn from_bs58check(s: &str) -> Result<Self, TokenError> {
        let bytes = bs58::decode(s.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| TokenError::Encoding(e.to_string()))?;

        if bytes.len() != 24 {
            return Err(TokenError::Length(bytes.len()));
        }

        let (id, position) = bytes.split_at(16);
        let log_id = Uuid::from_slice(id).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(position);

        Ok(Self::new(log_id, i64::from_be_bytes(buf)))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bs58check())
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bs58check(s)
    }
}

/// One committed row version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Append position; strictly increasing across the whole log
    pub position: i64,
    pub action_id: Uuid,
    pub action_index: u32,
    /// Site whose store committed this entry
    pub author_site: SiteId,
    pub record_id: GlobalId,
    pub committed_at: DateTime<Utc>,
    /// Full row version written
    pub payload: RecordRow,
}

/// Append entries for one action
///
/// Must run inside an active write transaction. `action_index` values continue
/// from the next unused index for `action_id`. Returns the new positions.
pub fn append(
    conn: &Connection,
    action_id: Uuid,
    author_site: SiteId,
    rows: &[RecordRow],
) -> StorageResult<Vec<i64>> {
    let next: u32 = conn.query_row(
        "SELECT COALESCE(MAX(action_index) + 1, 0) FROM checkin_log WHERE action_id = ?",
        params![action_id.to_string()],
        |row| row.get(0),
    )?;

    let committed_at = Utc::now().timestamp_millis();
    let mut stmt = conn.prepare(
        r#"
        INSERT INTO checkin_log
            (action_id, action_index, author_site, record_site, record_index, committed_at, payload)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )?;

    let mut positions = Vec::with_capacity(rows.len());
    for (offset, row) in (next..).zip(rows) {
        let payload = serde_json::to_string(row)?;
        stmt.execute(params![
            action_id.to_string(),
            offset,
            author_site.to_string(),
            row.id.site_id.to_string(),
            row.id.operation_index,
            committed_at,
            payload,
        ])?;
        positions.push(conn.last_insert_rowid());
    }

    debug!(
        action = %action_id,
        entries = positions.len(),
        "Appended operation log entries"
    );
    Ok(positions)
}

/// Token for the current tail of the log
pub fn tail(conn: &Connection) -> StorageResult<Token> {
    let log_id = read_log_id(conn)?;
    let position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), 0) FROM checkin_log",
        [],
        |row| row.get(0),
    )?;
    Ok(Token::new(log_id, position))
}

/// Check a token against this log
///
/// Returns `None` for a missing, foreign, or out-of-range token.
pub fn validate(conn: &Connection, token: Option<&Token>) -> StorageResult<Option<Token>> {
    let Some(token) = token else {
        return Ok(None);
    };

    let current = tail(conn)?;
    if token.log_id != current.log_id {
        debug!(token = %token, "Token issued by another log, resyncing");
        return Ok(None);
    }
    if token.position < 0 || token.position > current.position {
        debug!(token = %token, "Token past the log tail, resyncing");
        return Ok(None);
    }
    Ok(Some(*token))
}

/// Entries after `token`, up to the tail, plus a token for that tail
///
/// Scans from the beginning when the token is `None` or invalid. On an
/// unchanged log, calling this again with the returned token yields no entries
/// and the same token.
pub fn entries_since(
    conn: &Connection,
    token: Option<&Token>,
) -> StorageResult<(Vec<LogEntry>, Token)> {
    let start = validate(conn, token)?.map_or(0, |t| t.position);
    let tail = tail(conn)?;

    let mut stmt = conn.prepare(
        r#"
        SELECT position, action_id, action_index, author_site, record_site, record_index,
               committed_at, payload
        FROM checkin_log
        WHERE position > ? AND position <= ?
        ORDER BY position
        "#,
    )?;
    let entries = stmt
        .query_map(params![start, tail.position], map_entry)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((entries, tail))
}

/// Number of entries in the log
pub fn len(conn: &Connection) -> StorageResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM checkin_log", [], |row| row.get(0))
        .map_err(Into::into)
}

/// Rebuild record state from log entries
///
/// Every Lamport column is folded with [`crate::lamport::resolve`], so the
/// result is the same in any entry order. Creation time keeps the earliest
/// value seen. Replaying a
/// store's whole log yields exactly its primary table, since every row version
/// the table ever held was logged and each write only moves a column forward.
pub fn replay<'a, I>(entries: I) -> BTreeMap<GlobalId, RecordRow>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut state: BTreeMap<GlobalId, RecordRow> = BTreeMap::new();
    for entry in entries {
        match state.entry(entry.record_id) {
            Entry::Vacant(slot) => {
                slot.insert(entry.payload.clone());
            }
            Entry::Occupied(mut slot) => {
                let merged = slot.get().clone().merge(entry.payload.clone());
                slot.insert(merged);
            }
        }
    }
    state
}

fn map_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let action_id: String = row.get(1)?;
    let author_site: String = row.get(3)?;
    let record_site: String = row.get(4)?;
    let committed_at: i64 = row.get(6)?;
    let payload: String = row.get(7)?;

    let conversion =
        |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e)
        };

    Ok(LogEntry {
        position: row.get(0)?,
        action_id: Uuid::parse_str(&action_id).map_err(|e| conversion(1, Box::new(e)))?,
        action_index: row.get(2)?,
        author_site: author_site
            .parse()
            .map_err(|e| conversion(3, Box::new(e)))?,
        record_id: GlobalId::new(
            record_site
                .parse()
                .map_err(|e| conversion(4, Box::new(e)))?,
            row.get(5)?,
        ),
        committed_at: DateTime::from_timestamp_millis(committed_at)
            .ok_or_else(|| conversion(6, "timestamp out of range".into()))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion(7, Box::new(e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Drink, Model};
    use crate::storage::schema::init_schema;

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&mut conn).unwrap();
        conn
    }

    fn row(site: SiteId, index: u32) -> RecordRow {
        let model = Model::new(site, Utc::now(), Drink::default());
        RecordRow::first_version(GlobalId::new(site, index), &model, site)
    }

    #[test]
    fn test_empty_log_tail_is_zero() {
        let conn = setup();
        let token = tail(&conn).unwrap();
        assert_eq!(token.position(), 0);
        assert_eq!(*token.log_id(), read_log_id(&conn).unwrap());
    }

    #[test]
    fn test_append_assigns_contiguous_action_indices() {
        let conn = setup();
        let site = SiteId::new();
        let action = Uuid::new_v4();

        let first = append(&conn, action, site, &[row(site, 0), row(site, 1)]).unwrap();
        let second = append(&conn, action, site, &[row(site, 2)]).unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);

        let (entries, _) = entries_since(&conn, None).unwrap();
        let indices: Vec<u32> = entries.iter().map(|e| e.action_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(entries.iter().all(|e| e.action_id == action));
    }

    #[test]
    fn test_entries_since_null_then_quiescent() {
        let conn = setup();
        let site = SiteId::new();
        append(&conn, Uuid::new_v4(), site, &[row(site, 0)]).unwrap();
        append(&conn, Uuid::new_v4(), site, &[row(site, 1)]).unwrap();

        let (entries, token) = entries_since(&conn, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(token.position(), 2);

        let (again, same) = entries_since(&conn, Some(&token)).unwrap();
        assert!(again.is_empty());
        assert_eq!(same, token);
    }

    #[test]
    fn test_entries_since_returns_only_suffix() {
        let conn = setup();
        let site = SiteId::new();
        append(&conn, Uuid::new_v4(), site, &[row(site, 0)]).unwrap();
        let (_, token) = entries_since(&conn, None).unwrap();

        append(&conn, Uuid::new_v4(), site, &[row(site, 1)]).unwrap();
        let (entries, next) = entries_since(&conn, Some(&token)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record_id, GlobalId::new(site, 1));
        assert!(next.position() > token.position());
    }

    #[test]
    fn test_foreign_token_forces_full_scan() {
        let conn = setup();
        let site = SiteId::new();
        append(&conn, Uuid::new_v4(), site, &[row(site, 0)]).unwrap();

        let foreign = Token::new(Uuid::new_v4(), 1);
        assert_eq!(validate(&conn, Some(&foreign)).unwrap(), None);
        let (entries, _) = entries_since(&conn, Some(&foreign)).unwrap();
        assert_eq!(entries.len(), 1);

        let (_, token) = entries_since(&conn, None).unwrap();
        let future = Token::new(*token.log_id(), 50);
        let (entries, _) = entries_since(&conn, Some(&future)).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_token_text_form() {
        let token = Token::new(Uuid::new_v4(), 1234);
        let text = token.to_string();
        assert_eq!(text.parse::<Token>().unwrap(), token);

        assert!(matches!(
            "not base58 0OIl".parse::<Token>(),
            Err(TokenError::Encoding(_))
        ));
        let short = bs58::encode([1u8, 2, 3]).with_check().into_string();
        assert_eq!(Token::from_bs58check(&short), Err(TokenError::Length(3)));
    }

    #[test]
    fn test_replay_takes_highest_counter() {
        let conn = setup();
        let site = SiteId::new();
        let base = row(site, 0);
        let mut model = base.to_model();
        model.check_in.drink.abv = 8.0;
        let next = base.next_version(&model, site);

        append(&conn, Uuid::new_v4(), site, &[base]).unwrap();
        append(&conn, Uuid::new_v4(), site, &[next.clone()]).unwrap();

        let (entries, _) = entries_since(&conn, None).unwrap();
        let state = replay(&entries);
        assert_eq!(state.len(), 1);
        assert_eq!(state[&GlobalId::new(site, 0)], next);

        // Order does not matter for the result
        let reversed: Vec<LogEntry> = entries.into_iter().rev().collect();
        assert_eq!(replay(&reversed)[&GlobalId::new(site, 0)], next);
    }

    fn logged(position: i64, author: SiteId, payload: RecordRow) -> LogEntry {
        LogEntry {
            position,
            action_id: Uuid::new_v4(),
            action_index: 0,
            author_site: author,
            record_id: payload.id,
            committed_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn test_replay_ignores_stale_columns() {
        let site = SiteId::new();
        let base = row(site, 0);
        let mut model = base.to_model();
        model.check_in.drink.price = 9.5;
        let priced = base.next_version(&model, site);

        // An older version logged later must not roll the price back
        let entries = vec![logged(1, site, priced.clone()), logged(2, site, base)];
        let state = replay(&entries);
        assert_eq!(state[&GlobalId::new(site, 0)].price, priced.price);
    }

    #[test]
    fn test_replay_resolves_tied_counters_by_writing_site() {
        let low = SiteId::from_uuid(Uuid::from_u128(1));
        let high = SiteId::from_uuid(Uuid::from_u128(2));
        let base = row(low, 0);

        // Both replicas edit the price from the same base: equal counters
        let mut model = base.to_model();
        model.check_in.drink.price = 1.0;
        let from_low = base.next_version(&model, low);
        model.check_in.drink.price = 2.0;
        let from_high = base.next_version(&model, high);
        assert_eq!(from_low.price.counter, from_high.price.counter);

        // Logged by the low site last, the high site's write still wins
        let entries = vec![
            logged(1, low, base.clone()),
            logged(2, high, from_high.clone()),
            logged(3, low, from_low.clone()),
        ];
        let forward = replay(&entries);
        let reversed: Vec<LogEntry> = entries.iter().rev().cloned().collect();
        let backward = replay(&reversed);

        let id = GlobalId::new(low, 0);
        assert_eq!(forward[&id].price, from_high.price);
        assert_eq!(forward[&id], backward[&id]);
    }

    #[test]
    fn test_len_counts_entries() {
        let conn = setup();
        let site = SiteId::new();
        assert_eq!(len(&conn).unwrap(), 0);
        append(&conn, Uuid::new_v4(), site, &[row(site, 0), row(site, 1)]).unwrap();
        assert_eq!(len(&conn).unwrap(), 2);
    }
}
