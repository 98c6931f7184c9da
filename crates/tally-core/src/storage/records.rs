//! Primary table access
//!
//! Row mapping between `checkins` and [`RecordRow`]. All functions take a
//! connection or transaction handed out by the engine; none of them open
//! transactions of their own.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::{StorageError, StorageResult};
use crate::id::{GlobalId, SiteId, MAX_OPERATION_INDEX};
use crate::lamport::{LamportCounter, LamportValue};
use crate::models::{DrinkStyle, UntappdId};
use crate::record::RecordRow;

const SELECT_COLUMNS: &str = r#"
    SELECT id_site, id_index, creation_time,
           deleted_value, deleted_lamport, deleted_site,
           untappd_id_value, untappd_id_lamport, untappd_id_site,
           time_value, time_lamport, time_site,
           name_value, name_lamport, name_site,
           style_value, style_lamport, style_site,
           abv_value, abv_lamport, abv_site,
           price_value, price_lamport, price_site,
           volume_value, volume_lamport, volume_site
    FROM checkins
"#;

/// Get the current version of a record
pub fn get(conn: &Connection, id: &GlobalId) -> StorageResult<Option<RecordRow>> {
    let sql = format!("{SELECT_COLUMNS} WHERE id_site = ? AND id_index = ?");
    let row = conn
        .query_row(
            &sql,
            params![id.site_id.to_string(), id.operation_index],
            map_row,
        )
        .optional()?;
    Ok(row)
}

/// Insert or replace the current version of a record
pub fn upsert(conn: &Connection, row: &RecordRow) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO checkins (
            id_site, id_index, creation_time,
            deleted_value, deleted_lamport, deleted_site,
            untappd_id_value, untappd_id_lamport, untappd_id_site,
            time_value, time_lamport, time_site,
            name_value, name_lamport, name_site,
            style_value, style_lamport, style_site,
            abv_value, abv_lamport, abv_site,
            price_value, price_lamport, price_site,
            volume_value, volume_lamport, volume_site
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            row.id.site_id.to_string(),
            row.id.operation_index,
            row.creation_time.timestamp_millis(),
            row.deleted.value,
            row.deleted.counter.value(),
            row.deleted.site.to_string(),
            row.untappd_id.value.map(|id| id.0),
            row.untappd_id.counter.value(),
            row.untappd_id.site.to_string(),
            row.time.value.timestamp_millis(),
            row.time.counter.value(),
            row.time.site.to_string(),
            row.name.value,
            row.name.counter.value(),
            row.name.site.to_string(),
            row.style.value.as_str(),
            row.style.counter.value(),
            row.style.site.to_string(),
            row.abv.value,
            row.abv.counter.value(),
            row.abv.site.to_string(),
            row.price.value,
            row.price.counter.value(),
            row.price.site.to_string(),
            row.volume.value,
            row.volume.counter.value(),
            row.volume.site.to_string(),
        ],
    )?;
    Ok(())
}

/// Next unused operation index for `site`
///
/// Must be read inside the write transaction that uses it.
pub fn next_operation_index(conn: &Connection, site: &SiteId) -> StorageResult<u32> {
    let max: Option<u32> = conn.query_row(
        "SELECT MAX(id_index) FROM checkins WHERE id_site = ?",
        params![site.to_string()],
        |row| row.get(0),
    )?;

    let next = max.map_or(0, |index| index.saturating_add(1));
    if next > MAX_OPERATION_INDEX {
        return Err(StorageError::InvalidInput(format!(
            "Operation indices exhausted for site {}",
            site
        )));
    }
    Ok(next)
}

/// Records whose check-in time falls in `[from, to)`, ordered by time then ID
pub fn in_range(
    conn: &Connection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    include_deleted: bool,
) -> StorageResult<Vec<RecordRow>> {
    let sql = format!(
        "{SELECT_COLUMNS}
         WHERE time_value >= ?1 AND time_value < ?2 AND (?3 OR deleted_value = 0)
         ORDER BY time_value, id_site, id_index"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![ceil_millis(from), ceil_millis(to), include_deleted],
            map_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Most recently created live record
pub fn last_added(conn: &Connection) -> StorageResult<Option<RecordRow>> {
    let sql = format!(
        "{SELECT_COLUMNS}
         WHERE deleted_value = 0
         ORDER BY creation_time DESC, id_site DESC, id_index DESC
         LIMIT 1"
    );
    let row = conn.query_row(&sql, [], map_row).optional()?;
    Ok(row)
}

/// Every record, tombstones included, in ID order
pub fn all(conn: &Connection) -> StorageResult<Vec<RecordRow>> {
    let sql = format!("{SELECT_COLUMNS} ORDER BY id_site, id_index");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Total and tombstoned record counts
pub fn counts(conn: &Connection) -> StorageResult<(i64, i64)> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(deleted_value), 0) FROM checkins",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(Into::into)
}

/// Smallest stored millisecond value at or after `time`
///
/// Stored times are whole milliseconds, so for any stored `t`,
/// `t >= time` exactly when `t >= ceil_millis(time)`, and the same for `<`.
fn ceil_millis(time: DateTime<Utc>) -> i64 {
    let floor = time.timestamp_millis();
    if time.timestamp_subsec_nanos() % 1_000_000 == 0 {
        floor
    } else {
        floor + 1
    }
}

// ==================== Row mapping ====================

fn map_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    let site_id = site(row, 0)?;

    Ok(RecordRow {
        id: GlobalId::new(site_id, row.get(1)?),
        creation_time: millis(row, 2)?,
        deleted: column(row, 3, row.get(3)?)?,
        untappd_id: column(row, 6, row.get::<_, Option<i64>>(6)?.map(UntappdId))?,
        time: column(row, 9, millis(row, 9)?)?,
        name: column(row, 12, row.get(12)?)?,
        style: column(row, 15, style(row, 15)?)?,
        abv: column(row, 18, row.get(18)?)?,
        price: column(row, 21, row.get(21)?)?,
        volume: column(row, 24, row.get(24)?)?,
    })
}

/// A Lamport column whose value sits at `idx`, counter and site right after
fn column<T>(row: &Row<'_>, idx: usize, value: T) -> rusqlite::Result<LamportValue<T>> {
    Ok(LamportValue {
        value,
        counter: LamportCounter::new(row.get(idx + 1)?),
        site: site(row, idx + 2)?,
    })
}

fn site(row: &Row<'_>, idx: usize) -> rusqlite::Result<SiteId> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn style(row: &Row<'_>, idx: usize) -> rusqlite::Result<DrinkStyle> {
    let value: String = row.get(idx)?;
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Drink, Model};
    use crate::storage::schema::init_schema;
    use chrono::Duration;

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&mut conn).unwrap();
        conn
    }

    fn row_at(site: SiteId, index: u32, time: DateTime<Utc>) -> RecordRow {
        let model = Model::new(site, time, Drink::default());
        RecordRow::first_version(GlobalId::new(site, index), &model, site)
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = setup();
        let site = SiteId::new();
        let editor = SiteId::new();
        let mut row = row_at(site, 0, Utc::now());
        row.name = row.name.write(Some("Dunkel".to_string()), editor);
        row.untappd_id = LamportValue::initial(Some(UntappdId(99)), site);

        upsert(&conn, &row).unwrap();
        let loaded = get(&conn, &row.id).unwrap().unwrap();
        assert_eq!(loaded, row);
        assert_eq!(loaded.name.site, editor);
        assert_eq!(loaded.abv.site, site);

        assert!(get(&conn, &GlobalId::new(site, 1)).unwrap().is_none());
    }

    #[test]
    fn test_next_operation_index_is_site_scoped() {
        let conn = setup();
        let a = SiteId::new();
        let b = SiteId::new();

        assert_eq!(next_operation_index(&conn, &a).unwrap(), 0);
        upsert(&conn, &row_at(a, 0, Utc::now())).unwrap();
        upsert(&conn, &row_at(a, 1, Utc::now())).unwrap();

        assert_eq!(next_operation_index(&conn, &a).unwrap(), 2);
        assert_eq!(next_operation_index(&conn, &b).unwrap(), 0);
    }

    #[test]
    fn test_next_operation_index_stops_at_maximum() {
        let conn = setup();
        let site = SiteId::new();
        upsert(&conn, &row_at(site, MAX_OPERATION_INDEX, Utc::now())).unwrap();

        assert!(matches!(
            next_operation_index(&conn, &site),
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_in_range_is_half_open_and_ordered() {
        let conn = setup();
        let site = SiteId::new();
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        upsert(&conn, &row_at(site, 0, start + Duration::hours(2))).unwrap();
        upsert(&conn, &row_at(site, 1, start)).unwrap();
        upsert(&conn, &row_at(site, 2, start + Duration::days(1))).unwrap();

        let rows = in_range(&conn, start, start + Duration::days(1), false).unwrap();
        let ids: Vec<u32> = rows.iter().map(|r| r.id.operation_index).collect();
        assert_eq!(ids, vec![1, 0]);
    }

    #[test]
    fn test_in_range_bounds_below_a_millisecond() {
        let conn = setup();
        let site = SiteId::new();
        let stored = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        upsert(&conn, &row_at(site, 0, stored)).unwrap();

        let half = Duration::microseconds(500);
        let later = stored + Duration::hours(1);

        // Starts just after the stored time
        assert!(in_range(&conn, stored + half, later, false).unwrap().is_empty());
        // Ends just after the stored time
        assert_eq!(in_range(&conn, stored, stored + half, false).unwrap().len(), 1);
        // Ends exactly at it
        assert!(in_range(&conn, stored - half, stored, false).unwrap().is_empty());
    }

    #[test]
    fn test_ceil_millis() {
        let whole = DateTime::from_timestamp(10, 5_000_000).unwrap();
        assert_eq!(ceil_millis(whole), 10_005);
        assert_eq!(ceil_millis(whole + Duration::nanoseconds(1)), 10_006);

        let before_epoch = DateTime::from_timestamp(-1, 999_500_000).unwrap();
        assert_eq!(ceil_millis(before_epoch), 0);
    }

    #[test]
    fn test_in_range_skips_tombstones_unless_asked() {
        let conn = setup();
        let site = SiteId::new();
        let now = Utc::now();
        let mut row = row_at(site, 0, now);
        row.deleted = row.deleted.write(true, site);
        upsert(&conn, &row).unwrap();

        let from = now - Duration::hours(1);
        let to = now + Duration::hours(1);
        assert!(in_range(&conn, from, to, false).unwrap().is_empty());
        assert_eq!(in_range(&conn, from, to, true).unwrap().len(), 1);
        assert_eq!(counts(&conn).unwrap(), (1, 1));
    }

    #[test]
    fn test_last_added_uses_creation_time() {
        let conn = setup();
        let site = SiteId::new();
        let now = Utc::now();

        let mut older = row_at(site, 0, now + Duration::days(5));
        older.creation_time = now - Duration::hours(1);
        let mut newer = row_at(site, 1, now - Duration::days(5));
        newer.creation_time = now;
        upsert(&conn, &older).unwrap();
        upsert(&conn, &newer).unwrap();

        let last = last_added(&conn).unwrap().unwrap();
        assert_eq!(last.id.operation_index, 1);
    }

    #[test]
    fn test_last_added_empty() {
        let conn = setup();
        assert!(last_added(&conn).unwrap().is_none());
        assert_eq!(counts(&conn).unwrap(), (0, 0));
    }
}
