//! Row decoding and query filters.
//!
//! Every filter here has two renderings that must agree: `push_where` for the
//! structured SQL path and `matches` for the in-memory fallback path used when
//! the on-disk schema does not have the shape the SQL expects.

use crate::model::{
    from_millis, to_millis, DomainRecord, EventMetadata, EventStatus, EventType, OutboxEvent,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

pub const EVENT_COLUMNS: &str = "id, event_type, entity_id, user_id, is_new_record, metadata, \
     status, attempt_count, priority, created_at, last_attempt_at, completed_at, error_message";

pub const RECORD_COLUMNS: &str = "entity_id, user_id, record_type, payload, updated_at";

/// A table row that can be rebuilt from whatever columns happen to exist.
pub trait StoredRow: Sized + Send {
    const TABLE: &'static str;

    /// Returns `None` when the row lacks the fields that identify it.
    fn from_row_lenient(row: &SqliteRow) -> Option<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusSelector {
    #[default]
    Any,
    Is(EventStatus),
    /// `pending`, or `failed` with attempts left.
    Drainable { max_attempts: u32 },
    /// `failed` with no attempts left.
    Exhausted { max_attempts: u32 },
}

impl StatusSelector {
    fn matches(&self, ev: &OutboxEvent) -> bool {
        match *self {
            StatusSelector::Any => true,
            StatusSelector::Is(status) => ev.status == status,
            StatusSelector::Drainable { max_attempts } => {
                ev.status == EventStatus::Pending || ev.can_retry(max_attempts)
            }
            StatusSelector::Exhausted { max_attempts } => ev.is_exhausted(max_attempts),
        }
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match *self {
            StatusSelector::Any => {}
            StatusSelector::Is(status) => {
                qb.push(" AND status = ").push_bind(status.as_str());
            }
            StatusSelector::Drainable { max_attempts } => {
                qb.push(" AND (status = 'pending' OR (status = 'failed' AND attempt_count < ")
                    .push_bind(max_attempts as i64)
                    .push("))");
            }
            StatusSelector::Exhausted { max_attempts } => {
                qb.push(" AND status = 'failed' AND attempt_count >= ")
                    .push_bind(max_attempts as i64);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub status: StatusSelector,
    pub entity_ids: Option<Vec<String>>,
    pub event_type: Option<EventType>,
    pub created_before: Option<DateTime<Utc>>,
    pub completed_before: Option<DateTime<Utc>>,
    pub last_attempt_before: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_user(user_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: StatusSelector) -> Self {
        self.status = status;
        self
    }

    pub fn matches(&self, ev: &OutboxEvent) -> bool {
        if self.id.as_deref().is_some_and(|id| id != ev.id) {
            return false;
        }
        if self.user_id.as_deref().is_some_and(|u| u != ev.user_id) {
            return false;
        }
        if !self.status.matches(ev) {
            return false;
        }
        if let Some(ids) = &self.entity_ids {
            if !ids.iter().any(|e| *e == ev.entity_id) {
                return false;
            }
        }
        if self.event_type.is_some_and(|t| t != ev.event_type) {
            return false;
        }
        if self.created_before.is_some_and(|t| ev.created_at >= t) {
            return false;
        }
        if let Some(t) = self.completed_before {
            if !ev.completed_at.is_some_and(|c| c < t) {
                return false;
            }
        }
        if let Some(t) = self.last_attempt_before {
            if !ev.last_attempt_at.is_some_and(|a| a < t) {
                return false;
            }
        }
        true
    }

    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(id) = &self.id {
            qb.push(" AND id = ").push_bind(id.clone());
        }
        if let Some(user_id) = &self.user_id {
            qb.push(" AND user_id = ").push_bind(user_id.clone());
        }
        self.status.push_where(qb);
        if let Some(ids) = &self.entity_ids {
            if ids.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND entity_id IN (");
                let mut sep = qb.separated(", ");
                for id in ids {
                    sep.push_bind(id.clone());
                }
                sep.push_unseparated(")");
            }
        }
        if let Some(t) = self.event_type {
            qb.push(" AND event_type = ").push_bind(t.as_str());
        }
        if let Some(t) = self.created_before {
            qb.push(" AND created_at < ").push_bind(to_millis(t));
        }
        if let Some(t) = self.completed_before {
            qb.push(" AND completed_at < ").push_bind(to_millis(t));
        }
        if let Some(t) = self.last_attempt_before {
            qb.push(" AND last_attempt_at < ").push_bind(to_millis(t));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOrder {
    /// Priority descending, then oldest first.
    #[default]
    Drain,
    Oldest,
}

impl EventOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            EventOrder::Drain => " ORDER BY priority DESC, created_at ASC, rowid ASC",
            EventOrder::Oldest => " ORDER BY created_at ASC, rowid ASC",
        }
    }

    /// Stable, so rows scanned in rowid order keep insertion order on ties.
    pub fn sort(&self, events: &mut [OutboxEvent]) {
        match self {
            EventOrder::Drain => events.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            }),
            EventOrder::Oldest => events.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub user_id: Option<String>,
    pub record_type: Option<EventType>,
    pub entity_ids: Option<Vec<String>>,
}

impl RecordFilter {
    pub fn matches(&self, rec: &DomainRecord) -> bool {
        self.user_id.as_deref().map_or(true, |u| u == rec.user_id)
            && self.record_type.map_or(true, |t| t == rec.record_type)
            && self
                .entity_ids
                .as_ref()
                .map_or(true, |ids| ids.iter().any(|e| *e == rec.entity_id))
    }

    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(user_id) = &self.user_id {
            qb.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(t) = self.record_type {
            qb.push(" AND record_type = ").push_bind(t.as_str());
        }
        if let Some(ids) = &self.entity_ids {
            if ids.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND entity_id IN (");
                let mut sep = qb.separated(", ");
                for id in ids {
                    sep.push_bind(id.clone());
                }
                sep.push_unseparated(")");
            }
        }
    }
}

fn decode_error(column: &str, value: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unexpected value {value}").into(),
    }
}

fn millis_column(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    match row.try_get::<Option<i64>, _>(column)? {
        None => Ok(None),
        Some(ms) => from_millis(ms)
            .map(Some)
            .ok_or_else(|| decode_error(column, ms)),
    }
}

/// Decodes a row selected with [`EVENT_COLUMNS`]. Any mismatch with the
/// expected shape is reported as a decode error, which the compatibility
/// layer treats as structural.
pub fn decode_event(row: &SqliteRow) -> Result<OutboxEvent, sqlx::Error> {
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;
    let metadata = row
        .try_get::<Option<String>, _>("metadata")?
        .map(|raw| EventMetadata::decode(&raw))
        .transpose()
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: "metadata".into(),
            source: Box::new(e),
        })?;
    let attempt_count: i64 = row.try_get("attempt_count")?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_type: EventType::parse_type(&event_type)
            .ok_or_else(|| decode_error("event_type", &event_type))?,
        entity_id: row.try_get("entity_id")?,
        user_id: row.try_get("user_id")?,
        is_new_record: row.try_get("is_new_record")?,
        metadata,
        status: EventStatus::parse_status(&status).ok_or_else(|| decode_error("status", &status))?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| decode_error("attempt_count", attempt_count))?,
        priority: row.try_get("priority")?,
        created_at: millis_column(row, "created_at")?
            .ok_or_else(|| decode_error("created_at", "NULL"))?,
        last_attempt_at: millis_column(row, "last_attempt_at")?,
        completed_at: millis_column(row, "completed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

pub fn decode_record(row: &SqliteRow) -> Result<DomainRecord, sqlx::Error> {
    let record_type: String = row.try_get("record_type")?;
    let payload: String = row.try_get("payload")?;
    Ok(DomainRecord {
        entity_id: row.try_get("entity_id")?,
        user_id: row.try_get("user_id")?,
        record_type: EventType::parse_type(&record_type)
            .ok_or_else(|| decode_error("record_type", &record_type))?,
        payload: serde_json::from_str(&payload).map_err(|e| sqlx::Error::ColumnDecode {
            index: "payload".into(),
            source: Box::new(e),
        })?,
        updated_at: millis_column(row, "updated_at")?
            .ok_or_else(|| decode_error("updated_at", "NULL"))?,
    })
}

/// Reads a column if it exists and holds a value of the expected type.
fn column<T>(row: &SqliteRow, name: &str) -> Option<T>
where
    T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get::<Option<T>, _>(name).ok().flatten()
}

fn lenient_millis(row: &SqliteRow, name: &str) -> Option<DateTime<Utc>> {
    column::<i64>(row, name).and_then(from_millis)
}

impl StoredRow for OutboxEvent {
    const TABLE: &'static str = "outbox_events";

    fn from_row_lenient(row: &SqliteRow) -> Option<Self> {
        let id: String = column(row, "id")?;
        let entity_id: String = column(row, "entity_id")?;
        let user_id: String = column(row, "user_id")?;
        Some(OutboxEvent {
            id,
            event_type: column::<String>(row, "event_type")
                .and_then(|t| EventType::parse_type(&t))
                .unwrap_or(EventType::Generic),
            entity_id,
            user_id,
            is_new_record: column(row, "is_new_record").unwrap_or(true),
            metadata: column::<String>(row, "metadata")
                .and_then(|raw| EventMetadata::decode(&raw).ok()),
            status: column::<String>(row, "status")
                .and_then(|s| EventStatus::parse_legacy(&s))
                .unwrap_or(EventStatus::Pending),
            attempt_count: column::<i64>(row, "attempt_count")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            priority: column(row, "priority").unwrap_or(0),
            created_at: lenient_millis(row, "created_at").unwrap_or_default(),
            last_attempt_at: lenient_millis(row, "last_attempt_at"),
            completed_at: lenient_millis(row, "completed_at"),
            error_message: column(row, "error_message"),
        })
    }
}

impl StoredRow for DomainRecord {
    const TABLE: &'static str = "domain_records";

    fn from_row_lenient(row: &SqliteRow) -> Option<Self> {
        let entity_id: String = column(row, "entity_id")?;
        let user_id: String = column(row, "user_id")?;
        Some(DomainRecord {
            entity_id,
            user_id,
            record_type: column::<String>(row, "record_type")
                .and_then(|t| EventType::parse_type(&t))
                .unwrap_or(EventType::Generic),
            payload: column::<String>(row, "payload")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(serde_json::Value::Null),
            updated_at: lenient_millis(row, "updated_at").unwrap_or_default(),
        })
    }
}
