use super::model::{
    decode_event, decode_record, EventFilter, EventOrder, RecordFilter, EVENT_COLUMNS,
    RECORD_COLUMNS,
};
use crate::model::{to_millis, DomainRecord, EventStatus, OutboxEvent, OutboxStatistics};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Executor, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::{info, instrument};

pub type Pool = SqlitePool;

/// Tables owned by the engine, in drop order.
const ENGINE_TABLES: [&str; 3] = ["outbox_events", "domain_records", "schema_version"];

pub async fn init_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    let normalized = prepare_sqlite_url(database_url);
    let mut options = SqliteConnectOptions::from_str(&normalized)?.create_if_missing(true);
    if !normalized.starts_with("sqlite::memory") {
        // Enable WAL and stricter durability.
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    SqlitePoolOptions::new().connect_with(options).await
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

#[instrument(skip_all)]
pub async fn select_events(
    pool: &Pool,
    filter: &EventFilter,
    order: EventOrder,
    limit: Option<usize>,
) -> Result<Vec<OutboxEvent>, sqlx::Error> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {EVENT_COLUMNS} FROM outbox_events"));
    filter.push_where(&mut qb);
    qb.push(order.sql());
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(decode_event).collect()
}

/// Bounded read of the expected event shape; used to detect schema drift.
pub async fn check_event_shape(pool: &Pool) -> Result<(), sqlx::Error> {
    let rows = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM outbox_events LIMIT 1"))
        .fetch_all(pool)
        .await?;
    for row in &rows {
        decode_event(row)?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_events_by_status(
    pool: &Pool,
    user_id: Option<&str>,
    max_attempts: u32,
) -> Result<OutboxStatistics, sqlx::Error> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT status, COUNT(*) AS n, \
         SUM(CASE WHEN status = 'failed' AND attempt_count >= ",
    );
    qb.push_bind(max_attempts as i64)
        .push(" THEN 1 ELSE 0 END) AS exhausted FROM outbox_events");
    EventFilter::for_user(user_id).push_where(&mut qb);
    qb.push(" GROUP BY status");

    let rows = qb.build().fetch_all(pool).await?;
    let mut stats = OutboxStatistics::default();
    for row in rows {
        let status: String = row.try_get("status")?;
        let status = EventStatus::parse_status(&status).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: format!("unexpected value {status}").into(),
            }
        })?;
        let n: i64 = row.try_get("n")?;
        let exhausted: i64 = row.try_get("exhausted")?;
        stats.add(status, n as u64);
        stats.exhausted += exhausted as u64;
    }
    Ok(stats)
}

#[instrument(skip_all)]
pub async fn insert_event(
    conn: &mut SqliteConnection,
    ev: &OutboxEvent,
    metadata: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO outbox_events (id, event_type, entity_id, user_id, is_new_record, metadata, \
         status, attempt_count, priority, created_at, last_attempt_at, completed_at, error_message) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&ev.id)
    .bind(ev.event_type.as_str())
    .bind(&ev.entity_id)
    .bind(&ev.user_id)
    .bind(ev.is_new_record)
    .bind(metadata)
    .bind(ev.status.as_str())
    .bind(ev.attempt_count as i64)
    .bind(ev.priority)
    .bind(to_millis(ev.created_at))
    .bind(ev.last_attempt_at.map(to_millis))
    .bind(ev.completed_at.map(to_millis))
    .bind(&ev.error_message)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Persists every mutable field of an event. `metadata` is the encoded
/// `ev.metadata`. Returns affected rows.
#[instrument(skip_all)]
pub async fn update_event_row(
    conn: &mut SqliteConnection,
    ev: &OutboxEvent,
    metadata: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE outbox_events SET is_new_record = ?, metadata = ?, status = ?, attempt_count = ?, \
         priority = ?, last_attempt_at = ?, completed_at = ?, error_message = ? WHERE id = ?",
    )
    .bind(ev.is_new_record)
    .bind(metadata)
    .bind(ev.status.as_str())
    .bind(ev.attempt_count as i64)
    .bind(ev.priority)
    .bind(ev.last_attempt_at.map(to_millis))
    .bind(ev.completed_at.map(to_millis))
    .bind(&ev.error_message)
    .bind(&ev.id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

/// Last-write-wins upsert of `rec` with its already serialized `payload`.
/// Returns false when the stored row is newer.
#[instrument(skip_all)]
pub async fn upsert_record(
    conn: &mut SqliteConnection,
    rec: &DomainRecord,
    payload: &str,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "INSERT INTO domain_records (entity_id, user_id, record_type, payload, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(entity_id) DO UPDATE SET user_id = excluded.user_id, \
         record_type = excluded.record_type, payload = excluded.payload, \
         updated_at = excluded.updated_at \
         WHERE excluded.updated_at >= domain_records.updated_at",
    )
    .bind(&rec.entity_id)
    .bind(&rec.user_id)
    .bind(rec.record_type.as_str())
    .bind(payload)
    .bind(to_millis(rec.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn select_records(
    pool: &Pool,
    filter: &RecordFilter,
) -> Result<Vec<DomainRecord>, sqlx::Error> {
    let mut qb =
        QueryBuilder::<Sqlite>::new(format!("SELECT {RECORD_COLUMNS} FROM domain_records"));
    filter.push_where(&mut qb);
    qb.push(" ORDER BY updated_at ASC, rowid ASC");
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(decode_record).collect()
}

/// Unfiltered read of a whole table in rowid order, every column plus the
/// rowid under `row_key`. No column other than rowid is assumed to exist.
/// The statement is not cached: `*` expands to whatever columns the table has
/// now, and a cached plan would keep the pre-migration column list.
pub async fn scan_table<'e, E>(
    executor: E,
    table: &str,
    limit: Option<u32>,
) -> Result<Vec<SqliteRow>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut sql = format!("SELECT rowid AS row_key, * FROM {table} ORDER BY rowid");
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    sqlx::query(&sql).persistent(false).fetch_all(executor).await
}

pub async fn delete_rows(
    conn: &mut SqliteConnection,
    table: &str,
    row_keys: &[i64],
) -> Result<u64, sqlx::Error> {
    let sql = format!("DELETE FROM {table} WHERE rowid = ?");
    let mut deleted = 0;
    for key in row_keys {
        deleted += sqlx::query(&sql)
            .bind(*key)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(deleted)
}

/// Stamped schema version; 0 when the store has never been migrated.
pub async fn read_schema_version(conn: &mut SqliteConnection) -> Result<u32, sqlx::Error> {
    let exists: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
    )
    .fetch_optional(&mut *conn)
    .await?;
    if exists.is_none() {
        return Ok(0);
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(version.unwrap_or(0).max(0) as u32)
}

/// Stamps `version`, creating the marker table first for plans whose first
/// stage does not.
pub async fn stamp_schema_version(
    conn: &mut SqliteConnection,
    version: u32,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (\
         id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL, updated_at INTEGER NOT NULL)",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
    )
    .bind(version as i64)
    .bind(to_millis(at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Runs a multi-statement DDL script.
pub async fn execute_script(conn: &mut SqliteConnection, sql: &str) -> Result<(), sqlx::Error> {
    (&mut *conn).execute(sql).await?;
    Ok(())
}

/// Rewrites free-form status text left by older builds to the closed set.
pub async fn normalize_legacy_statuses(conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let rows = scan_table(&mut *conn, "outbox_events", None).await?;
    let mut fixed = 0;
    for row in rows {
        let key: i64 = row.try_get("row_key")?;
        let raw: Option<String> = row.try_get("status").ok().flatten();
        let normalized = raw
            .as_deref()
            .and_then(EventStatus::parse_legacy)
            .unwrap_or(EventStatus::Pending);
        if raw.as_deref() == Some(normalized.as_str()) {
            continue;
        }
        fixed += sqlx::query("UPDATE outbox_events SET status = ? WHERE rowid = ?")
            .bind(normalized.as_str())
            .bind(key)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(fixed)
}

/// Gives every event without metadata an empty `generic` payload.
pub async fn backfill_generic_metadata(conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE outbox_events SET metadata = '{\"kind\":\"generic\",\"data\":{}}' \
         WHERE metadata IS NULL",
    )
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

/// Drops every engine table so the migration plan rebuilds from version 0.
#[instrument(skip_all)]
pub async fn reset_local_store(pool: &Pool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for table in ENGINE_TABLES {
        (&mut *tx)
            .execute(format!("DROP TABLE IF EXISTS {table}").as_str())
            .await?;
    }
    tx.commit().await?;
    info!("local store reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn file_urls_are_normalized_and_parent_created() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/store.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn version_is_zero_on_empty_store() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(read_schema_version(&mut conn).await.unwrap(), 0);
    }
}
