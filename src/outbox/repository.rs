use crate::compat::{Compat, CompatibilityOutcome, SchemaCompat};
use crate::db::{self, EventFilter, EventOrder, Pool, RecordFilter, StatusSelector};
use crate::error::{OutboxError, OutboxResult};
use crate::model::{
    from_millis, to_millis, Clock, DomainRecord, EventStatus, EventType, NewEvent, OutboxEvent,
    OutboxStatistics, RetryPolicy, SystemClock,
};
use chrono::{DateTime, Utc};
use sqlx::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

const MAX_IDENTIFIER_LEN: usize = 128;

fn validate_identifier(field: &str, value: &str) -> OutboxResult<()> {
    let well_formed = !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if well_formed {
        Ok(())
    } else {
        Err(OutboxError::Validation(format!(
            "{field} {value:?} is not a valid identifier"
        )))
    }
}

fn encode_metadata(ev: &OutboxEvent) -> OutboxResult<Option<String>> {
    Ok(ev.metadata.as_ref().map(|m| m.encode()).transpose()?)
}

/// Façade over the event store. Every mutator runs its read-modify-write
/// sequence under one write lock, so the store only ever has a single writer.
pub struct OutboxRepository {
    compat: SchemaCompat,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl OutboxRepository {
    pub fn new(pool: Pool, policy: RetryPolicy) -> Self {
        Self {
            compat: SchemaCompat::new(pool, None),
            policy,
            clock: Arc::new(SystemClock),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scan_limit(mut self, limit: Option<u32>) -> Self {
        self.compat = SchemaCompat::new(self.compat.pool().clone(), limit);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &Pool {
        self.compat.pool()
    }

    pub fn compat(&self) -> &SchemaCompat {
        &self.compat
    }

    /// Current time at the precision events are stored with (milliseconds),
    /// so returned events compare equal to their stored rows.
    pub fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        from_millis(to_millis(now)).unwrap_or(now)
    }

    fn new_event(&self, new: NewEvent) -> OutboxResult<OutboxEvent> {
        validate_identifier("entity_id", &new.entity_id)?;
        validate_identifier("user_id", &new.user_id)?;
        Ok(OutboxEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: new.event_type,
            entity_id: new.entity_id,
            user_id: new.user_id,
            is_new_record: new.is_new_record,
            metadata: new.metadata,
            status: EventStatus::Pending,
            attempt_count: 0,
            priority: new.priority,
            created_at: self.now(),
            last_attempt_at: None,
            completed_at: None,
            error_message: None,
        })
    }

    #[instrument(skip_all, fields(entity_id = %new.entity_id, event_type = %new.event_type))]
    pub async fn create_event(&self, new: NewEvent) -> OutboxResult<OutboxEvent> {
        let event = self.new_event(new)?;
        let metadata = encode_metadata(&event)?;
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool().acquire().await?;
        db::insert_event(&mut conn, &event, metadata.as_deref()).await?;
        info!(id = %event.id, "outbox event created");
        Ok(event)
    }

    /// Persists `record` (last write wins) and its outbox event in one
    /// transaction. Returns `None` when a newer version of the record is
    /// already stored, in which case no event is created.
    #[instrument(skip_all, fields(entity_id = %record.entity_id))]
    pub async fn save_record_with_event(
        &self,
        record: DomainRecord,
        new: NewEvent,
    ) -> OutboxResult<Option<OutboxEvent>> {
        if record.entity_id != new.entity_id || record.user_id != new.user_id {
            return Err(OutboxError::Validation(
                "record and event must reference the same entity and user".into(),
            ));
        }
        let event = self.new_event(new)?;
        let metadata = encode_metadata(&event)?;
        let payload = serde_json::to_string(&record.payload)?;

        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool().acquire().await?;
        let mut tx = conn.begin().await?;
        if !db::upsert_record(&mut tx, &record, &payload).await? {
            info!("stored record is newer; skipping outbox event");
            tx.rollback().await?;
            return Ok(None);
        }
        db::insert_event(&mut tx, &event, metadata.as_deref()).await?;
        tx.commit().await?;
        info!(id = %event.id, "record saved with outbox event");
        Ok(Some(event))
    }

    fn settle<T>(&self, op: &'static str, res: Compat<T>) -> OutboxResult<T> {
        match res.outcome() {
            CompatibilityOutcome::Normal => {}
            CompatibilityOutcome::FallbackFiltered => warn!(op, "served by compatibility fallback"),
            CompatibilityOutcome::Unrecoverable => error!(op, "local store unrecoverable"),
        }
        res.into_result()
    }

    async fn query_events(
        &self,
        op: &'static str,
        filter: EventFilter,
        order: EventOrder,
        limit: Option<usize>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let res = self
            .compat
            .read(
                db::select_events(self.pool(), &filter, order, limit),
                |ev: &OutboxEvent| filter.matches(ev),
                |mut events| {
                    order.sort(&mut events);
                    if let Some(limit) = limit {
                        events.truncate(limit);
                    }
                    events
                },
            )
            .await?;
        self.settle(op, res)
    }

    /// Pending or retryable events, highest priority first, then oldest.
    pub async fn fetch_pending_events(
        &self,
        user_id: Option<&str>,
        limit: Option<usize>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let filter = EventFilter::for_user(user_id).with_status(StatusSelector::Drainable {
            max_attempts: self.policy.max_attempts,
        });
        self.query_events("fetch_pending_events", filter, EventOrder::Drain, limit)
            .await
    }

    pub async fn fetch_events(
        &self,
        status: EventStatus,
        user_id: Option<&str>,
        limit: Option<usize>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let filter = EventFilter::for_user(user_id).with_status(StatusSelector::Is(status));
        self.query_events("fetch_events", filter, EventOrder::Oldest, limit)
            .await
    }

    pub async fn fetch_event(&self, id: &str) -> OutboxResult<Option<OutboxEvent>> {
        let mut found = self
            .query_events("fetch_event", EventFilter::by_id(id), EventOrder::Oldest, Some(1))
            .await?;
        Ok(found.pop())
    }

    pub async fn fetch_events_for_entity(
        &self,
        entity_id: &str,
        event_type: Option<EventType>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let filter = EventFilter {
            entity_ids: Some(vec![entity_id.to_string()]),
            event_type,
            ..Default::default()
        };
        self.query_events("fetch_events_for_entity", filter, EventOrder::Oldest, None)
            .await
    }

    /// Failed events with no attempts left; these need the user's attention.
    pub async fn fetch_exhausted_events(
        &self,
        user_id: Option<&str>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let filter = EventFilter::for_user(user_id).with_status(StatusSelector::Exhausted {
            max_attempts: self.policy.max_attempts,
        });
        self.query_events("fetch_exhausted_events", filter, EventOrder::Oldest, None)
            .await
    }

    pub async fn get_stale_events(&self, user_id: Option<&str>) -> OutboxResult<Vec<OutboxEvent>> {
        let filter = EventFilter {
            created_before: Some(self.clock.now() - self.policy.stale_after),
            ..EventFilter::for_user(user_id).with_status(StatusSelector::Is(EventStatus::Pending))
        };
        self.query_events("get_stale_events", filter, EventOrder::Oldest, None)
            .await
    }

    /// Claimed events whose processing pass never reported back.
    pub async fn fetch_abandoned_events(
        &self,
        user_id: Option<&str>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let filter = EventFilter {
            last_attempt_before: Some(self.clock.now() - self.policy.stale_after),
            ..EventFilter::for_user(user_id)
                .with_status(StatusSelector::Is(EventStatus::Processing))
        };
        self.query_events("fetch_abandoned_events", filter, EventOrder::Oldest, None)
            .await
    }

    pub async fn get_statistics(&self, user_id: Option<&str>) -> OutboxResult<OutboxStatistics> {
        let filter = EventFilter::for_user(user_id);
        let max_attempts = self.policy.max_attempts;
        let res = self
            .compat
            .read(
                db::count_events_by_status(self.pool(), user_id, max_attempts),
                |ev: &OutboxEvent| filter.matches(ev),
                |events| {
                    let mut stats = OutboxStatistics::default();
                    for ev in &events {
                        stats.add(ev.status, 1);
                        if ev.is_exhausted(max_attempts) {
                            stats.exhausted += 1;
                        }
                    }
                    stats
                },
            )
            .await?;
        self.settle("get_statistics", res)
    }

    fn check_transition(&self, ev: &OutboxEvent, to: EventStatus) -> OutboxResult<()> {
        let legal = ev.status.can_transition_to(to)
            && (to != EventStatus::Pending || ev.can_retry(self.policy.max_attempts));
        if legal {
            Ok(())
        } else {
            Err(OutboxError::InvalidTransition {
                id: ev.id.clone(),
                from: ev.status,
                to,
            })
        }
    }

    async fn load(&self, id: &str) -> OutboxResult<OutboxEvent> {
        self.fetch_event(id)
            .await?
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))
    }

    async fn persist(&self, ev: &OutboxEvent) -> OutboxResult<()> {
        let metadata = encode_metadata(ev)?;
        let mut conn = self.pool().acquire().await?;
        if db::update_event_row(&mut conn, ev, metadata.as_deref()).await? == 0 {
            return Err(OutboxError::NotFound(ev.id.clone()));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        to: EventStatus,
        apply: impl FnOnce(&mut OutboxEvent, DateTime<Utc>),
    ) -> OutboxResult<OutboxEvent> {
        let _guard = self.write_lock.lock().await;
        let mut ev = self.load(id).await?;
        self.check_transition(&ev, to)?;
        ev.status = to;
        apply(&mut ev, self.now());
        self.persist(&ev).await?;
        Ok(ev)
    }

    /// Writes caller-side changes to an event: metadata, priority and
    /// `is_new_record`. Status changes go through `mark_as_*` and
    /// `reset_for_retry`, which apply the transition effects; here they fail
    /// with `InvalidTransition`. Identity and attempt bookkeeping are immutable.
    pub async fn update_event(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let _guard = self.write_lock.lock().await;
        let stored = self.load(&event.id).await?;
        if stored.status != event.status {
            return Err(OutboxError::InvalidTransition {
                id: event.id.clone(),
                from: stored.status,
                to: event.status,
            });
        }
        if stored.event_type != event.event_type
            || stored.entity_id != event.entity_id
            || stored.user_id != event.user_id
            || stored.created_at != event.created_at
        {
            return Err(OutboxError::Validation(format!(
                "event {} identity fields are immutable",
                event.id
            )));
        }
        if stored.attempt_count != event.attempt_count
            || stored.last_attempt_at != event.last_attempt_at
            || stored.completed_at != event.completed_at
            || stored.error_message != event.error_message
        {
            return Err(OutboxError::Validation(format!(
                "event {} attempt fields only change through transitions",
                event.id
            )));
        }
        let updated = OutboxEvent {
            metadata: event.metadata.clone(),
            priority: event.priority,
            is_new_record: event.is_new_record,
            ..stored
        };
        self.persist(&updated).await
    }

    pub async fn mark_as_processing(&self, id: &str) -> OutboxResult<OutboxEvent> {
        self.transition(id, EventStatus::Processing, |ev, now| {
            ev.attempt_count += 1;
            ev.last_attempt_at = Some(now);
        })
        .await
    }

    pub async fn mark_as_completed(&self, id: &str) -> OutboxResult<OutboxEvent> {
        self.transition(id, EventStatus::Completed, |ev, now| {
            ev.error_message = None;
            ev.completed_at = Some(now);
        })
        .await
    }

    pub async fn mark_as_failed(&self, id: &str, error: &str) -> OutboxResult<OutboxEvent> {
        let message = if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error.to_string()
        };
        self.transition(id, EventStatus::Failed, move |ev, now| {
            ev.error_message = Some(message);
            ev.last_attempt_at = Some(now);
        })
        .await
    }

    /// Moves retryable failed events back to pending. Ids that are unknown or
    /// not retryable are skipped. Returns how many were moved.
    pub async fn reset_for_retry(&self, ids: &[String]) -> OutboxResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut moved = 0;
        for id in ids {
            let Some(mut ev) = self.fetch_event(id).await? else {
                continue;
            };
            if !ev.can_retry(self.policy.max_attempts) {
                continue;
            }
            ev.status = EventStatus::Pending;
            ev.error_message = None;
            self.persist(&ev).await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Operator action: re-admits failed events even when their attempts are
    /// used up. The attempt count is kept.
    pub async fn requeue_exhausted(&self, ids: &[String]) -> OutboxResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut moved = 0;
        for id in ids {
            let Some(mut ev) = self.fetch_event(id).await? else {
                continue;
            };
            if ev.status != EventStatus::Failed {
                continue;
            }
            ev.status = EventStatus::Pending;
            ev.error_message = None;
            self.persist(&ev).await?;
            warn!(id = %ev.id, attempts = ev.attempt_count, "exhausted event requeued");
            moved += 1;
        }
        Ok(moved)
    }

    async fn delete_matching(&self, op: &'static str, filter: EventFilter) -> OutboxResult<u64> {
        let _guard = self.write_lock.lock().await;
        let res = self
            .compat
            .delete(|ev: &OutboxEvent| filter.matches(ev))
            .await;
        let deleted = self.settle(op, res)?;
        if deleted > 0 {
            info!(op, deleted, "outbox events deleted");
        }
        Ok(deleted)
    }

    pub async fn delete_completed_events(&self, older_than: DateTime<Utc>) -> OutboxResult<u64> {
        let filter = EventFilter {
            completed_before: Some(older_than),
            ..EventFilter::default().with_status(StatusSelector::Is(EventStatus::Completed))
        };
        self.delete_matching("delete_completed_events", filter).await
    }

    /// Deletes completed events older than the retention window.
    pub async fn purge_expired(&self) -> OutboxResult<u64> {
        let cutoff = self.clock.now() - self.policy.retention;
        self.delete_completed_events(cutoff).await
    }

    pub async fn delete_event(&self, id: &str) -> OutboxResult<u64> {
        self.delete_matching("delete_event", EventFilter::by_id(id))
            .await
    }

    pub async fn delete_events(&self, entity_ids: &[String]) -> OutboxResult<u64> {
        let filter = EventFilter {
            entity_ids: Some(entity_ids.to_vec()),
            ..Default::default()
        };
        self.delete_matching("delete_events", filter).await
    }

    pub async fn delete_all_events(&self, user_id: &str) -> OutboxResult<u64> {
        self.delete_matching("delete_all_events", EventFilter::for_user(Some(user_id)))
            .await
    }

    /// Last-write-wins upsert without an outbox event. Returns false when the
    /// stored record is newer.
    pub async fn upsert_record(&self, record: &DomainRecord) -> OutboxResult<bool> {
        validate_identifier("entity_id", &record.entity_id)?;
        validate_identifier("user_id", &record.user_id)?;
        let payload = serde_json::to_string(&record.payload)?;
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool().acquire().await?;
        Ok(db::upsert_record(&mut conn, record, &payload).await?)
    }

    pub async fn fetch_records(
        &self,
        user_id: &str,
        record_type: Option<EventType>,
    ) -> OutboxResult<Vec<DomainRecord>> {
        let filter = RecordFilter {
            user_id: Some(user_id.to_string()),
            record_type,
            entity_ids: None,
        };
        self.query_records("fetch_records", filter).await
    }

    pub async fn fetch_record(&self, entity_id: &str) -> OutboxResult<Option<DomainRecord>> {
        let filter = RecordFilter {
            entity_ids: Some(vec![entity_id.to_string()]),
            ..Default::default()
        };
        let mut found = self.query_records("fetch_record", filter).await?;
        Ok(found.pop())
    }

    async fn query_records(
        &self,
        op: &'static str,
        filter: RecordFilter,
    ) -> OutboxResult<Vec<DomainRecord>> {
        let res = self
            .compat
            .read(
                db::select_records(self.pool(), &filter),
                |rec: &DomainRecord| filter.matches(rec),
                |records| records,
            )
            .await?;
        self.settle(op, res)
    }

    pub async fn delete_records(&self, entity_ids: &[String]) -> OutboxResult<u64> {
        let filter = RecordFilter {
            entity_ids: Some(entity_ids.to_vec()),
            ..Default::default()
        };
        let _guard = self.write_lock.lock().await;
        let res = self
            .compat
            .delete(|rec: &DomainRecord| filter.matches(rec))
            .await;
        self.settle("delete_records", res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("entity_id", "6F9619FF-8B86-D011-B42D-00C04FC964FF").is_ok());
        assert!(validate_identifier("entity_id", "meal:2024-01-01.1").is_ok());
        assert!(validate_identifier("entity_id", "").is_err());
        assert!(validate_identifier("user_id", "has space").is_err());
        assert!(validate_identifier("user_id", &"x".repeat(129)).is_err());
        let err = validate_identifier("user_id", "a/b").unwrap_err();
        assert!(matches!(err, OutboxError::Validation(msg) if msg.contains("user_id")));
    }
}
