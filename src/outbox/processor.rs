use super::repository::OutboxRepository;
use crate::error::{OutboxError, OutboxResult, SyncError};
use crate::model::{EventStatus, EventType, NewEvent, OutboxEvent};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Pushes one event to the remote backend. Retries re-invoke it with the same
/// entity and payload, so implementations must be idempotent.
#[async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn execute(&self, event: &OutboxEvent) -> Result<(), SyncError>;
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<EventType, Arc<dyn SyncExecutor>>,
    fallback: Option<Arc<dyn SyncExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, event_type: EventType, executor: Arc<dyn SyncExecutor>) -> Self {
        self.executors.insert(event_type, executor);
        self
    }

    /// Used for every event type without a dedicated executor.
    pub fn with_fallback(mut self, executor: Arc<dyn SyncExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn get(&self, event_type: EventType) -> Option<&Arc<dyn SyncExecutor>> {
        self.executors.get(&event_type).or(self.fallback.as_ref())
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Failures that used the last attempt.
    pub exhausted: usize,
    /// Not due yet, or another event for the same entity went first.
    pub deferred: usize,
    /// Abandoned claims moved to failed before the pass.
    pub recovered: usize,
}

pub struct OutboxProcessor {
    repo: Arc<OutboxRepository>,
    executors: ExecutorRegistry,
    batch_size: usize,
}

impl OutboxProcessor {
    pub fn new(repo: Arc<OutboxRepository>, executors: ExecutorRegistry) -> Self {
        Self {
            repo,
            executors,
            batch_size: 50,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn repository(&self) -> &Arc<OutboxRepository> {
        &self.repo
    }

    /// Creates an event unless the entity already has an active one. A pending
    /// event absorbs the new request (newest metadata, highest priority); a
    /// processing event is returned as is.
    #[instrument(skip_all, fields(entity_id = %new.entity_id))]
    pub async fn enqueue(&self, new: NewEvent) -> OutboxResult<OutboxEvent> {
        let active = self
            .repo
            .fetch_events_for_entity(&new.entity_id, Some(new.event_type))
            .await?
            .into_iter()
            .find(|ev| ev.user_id == new.user_id && ev.status.is_active());

        let Some(mut existing) = active else {
            return self.repo.create_event(new).await;
        };
        if existing.status == EventStatus::Pending {
            let mut changed = false;
            if new.metadata.is_some() && new.metadata != existing.metadata {
                existing.metadata = new.metadata;
                changed = true;
            }
            if new.priority > existing.priority {
                existing.priority = new.priority;
                changed = true;
            }
            if changed {
                self.repo.update_event(&existing).await?;
            }
        }
        debug!(id = %existing.id, status = %existing.status, "coalesced onto active event");
        Ok(existing)
    }

    /// Moves claims that never reported back to failed, so backoff decides
    /// when they run again.
    pub async fn recover_abandoned(&self, user_id: &str) -> OutboxResult<usize> {
        let mut recovered = 0;
        for ev in self.repo.fetch_abandoned_events(Some(user_id)).await? {
            match self
                .repo
                .mark_as_failed(&ev.id, "processing abandoned before completion")
                .await
            {
                Ok(_) => {
                    warn!(id = %ev.id, "recovered abandoned claim");
                    recovered += 1;
                }
                Err(OutboxError::InvalidTransition { .. }) | Err(OutboxError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(recovered)
    }

    /// One drain pass over `user_id`'s pending and retryable events.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn process_pending(&self, user_id: &str) -> OutboxResult<PassReport> {
        let mut report = PassReport {
            recovered: self.recover_abandoned(user_id).await?,
            ..Default::default()
        };
        let policy = self.repo.policy().clone();
        let now = self.repo.now();

        // Backoff and entity ordering are applied before the batch limit so
        // events waiting out a delay never crowd out due ones.
        let mut seen_entities = HashSet::new();
        let mut batch = Vec::new();
        for ev in self.repo.fetch_pending_events(Some(user_id), None).await? {
            let first_for_entity = seen_entities.insert(ev.entity_id.clone());
            if first_for_entity && batch.len() < self.batch_size && policy.is_due(&ev, now) {
                batch.push(ev);
            } else {
                report.deferred += 1;
            }
        }

        for ev in batch {
            if ev.status == EventStatus::Failed
                && self.repo.reset_for_retry(&[ev.id.clone()]).await? == 0
            {
                report.deferred += 1;
                continue;
            }
            let claimed = match self.repo.mark_as_processing(&ev.id).await {
                Ok(claimed) => claimed,
                Err(OutboxError::InvalidTransition { .. }) | Err(OutboxError::NotFound(_)) => {
                    debug!(id = %ev.id, "event no longer claimable");
                    report.deferred += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            report.claimed += 1;

            match self.dispatch(&claimed).await {
                Ok(()) => {
                    self.repo.mark_as_completed(&claimed.id).await?;
                    report.completed += 1;
                    info!(
                        id = %claimed.id,
                        event_type = %claimed.event_type,
                        entity_id = %claimed.entity_id,
                        attempt = claimed.attempt_count,
                        "outbox event synced"
                    );
                }
                Err(err) => {
                    let failed = self.repo.mark_as_failed(&claimed.id, &err.to_string()).await?;
                    report.failed += 1;
                    if failed.is_exhausted(policy.max_attempts) {
                        report.exhausted += 1;
                        error!(
                            id = %failed.id,
                            entity_id = %failed.entity_id,
                            attempts = failed.attempt_count,
                            error = %err,
                            "outbox event exhausted its retries"
                        );
                    } else {
                        warn!(
                            id = %failed.id,
                            attempt = failed.attempt_count,
                            retry_in_secs = policy.next_retry_delay(failed.attempt_count).num_seconds(),
                            error = %err,
                            "outbox event failed; backoff"
                        );
                    }
                }
            }
        }
        Ok(report)
    }

    async fn dispatch(&self, ev: &OutboxEvent) -> Result<(), SyncError> {
        match self.executors.get(ev.event_type) {
            Some(executor) => executor.execute(ev).await,
            None => Err(SyncError::NoExecutor(ev.event_type.to_string())),
        }
    }

    /// Stale pending events mean the loop fell behind; the next pass should
    /// start right away instead of after the poll interval.
    pub async fn has_overdue_work(&self, user_id: &str) -> OutboxResult<bool> {
        Ok(!self.repo.get_stale_events(Some(user_id)).await?.is_empty())
    }

    /// Drains in a loop until `shutdown` flips to true. An idle pass is
    /// followed by the poll sleep, except that stale pending work earns one
    /// immediate re-pass. Stale events a re-pass could not claim are waiting
    /// on an entity in backoff, so the loop sleeps after that.
    pub async fn run(&self, user_id: &str, poll: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(user_id, poll_ms = poll.as_millis() as u64, "outbox processor started");
        let mut repassed = false;
        while !*shutdown.borrow() {
            let sleep_for = match self.process_pending(user_id).await {
                Ok(report) if report.claimed > 0 => {
                    repassed = false;
                    None
                }
                Ok(_) if repassed => {
                    repassed = false;
                    Some(poll)
                }
                Ok(_) => match self.has_overdue_work(user_id).await {
                    Ok(true) => {
                        warn!(user_id, "stale pending events; forcing another pass");
                        repassed = true;
                        None
                    }
                    Ok(false) => Some(poll),
                    Err(err) => {
                        error!(?err, "stale check failed");
                        Some(poll)
                    }
                },
                Err(err) if err.is_unrecoverable() => {
                    error!(?err, remediation = err.remediation(), "outbox processor stopping");
                    return;
                }
                Err(err) => {
                    error!(?err, "outbox processor error");
                    Some(Duration::from_secs(1))
                }
            };
            if let Some(delay) = sleep_for {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(user_id, "outbox processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl SyncExecutor for Noop {
        async fn execute(&self, _event: &OutboxEvent) -> Result<(), SyncError> {
            Ok(())
        }
    }

    #[test]
    fn registry_prefers_dedicated_executor() {
        let dedicated: Arc<dyn SyncExecutor> = Arc::new(Noop);
        let fallback: Arc<dyn SyncExecutor> = Arc::new(Noop);
        let registry = ExecutorRegistry::new()
            .register(EventType::MealLog, dedicated.clone())
            .with_fallback(fallback.clone());
        assert!(Arc::ptr_eq(registry.get(EventType::MealLog).unwrap(), &dedicated));
        assert!(Arc::ptr_eq(registry.get(EventType::Goal).unwrap(), &fallback));
        assert!(ExecutorRegistry::new().get(EventType::Goal).is_none());
    }
}
