use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use lume_sync::db;
use lume_sync::error::SyncError;
use lume_sync::migration::MigrationPlan;
use lume_sync::model::{
    Clock, EventMetadata, EventStatus, EventType, ManualClock, NewEvent, OutboxEvent,
    RetryPolicy,
};
use lume_sync::outbox::{ExecutorRegistry, OutboxProcessor, OutboxRepository, SyncExecutor};

const USER: &str = "user-1";

#[derive(Clone, Default)]
struct RecordingExecutor {
    responses: Arc<Mutex<VecDeque<Result<(), SyncError>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingExecutor {
    fn with_responses(responses: Vec<Result<(), SyncError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            calls: Arc::default(),
        }
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SyncExecutor for RecordingExecutor {
    async fn execute(&self, event: &OutboxEvent) -> Result<(), SyncError> {
        self.calls.lock().await.push(event.entity_id.clone());
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

async fn setup(
    policy: RetryPolicy,
    executor: &RecordingExecutor,
) -> (Arc<ManualClock>, OutboxProcessor) {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    MigrationPlan::standard().migrate(&pool).await.unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
    ));
    let repo = Arc::new(OutboxRepository::new(pool, policy).with_clock(clock.clone()));
    let registry = ExecutorRegistry::new().with_fallback(Arc::new(executor.clone()));
    (clock, OutboxProcessor::new(repo, registry))
}

fn workout(entity: &str) -> NewEvent {
    NewEvent::new(EventType::Workout, entity, USER).with_metadata(EventMetadata::Workout {
        activity: "run".into(),
        duration_secs: 1800,
        calories: Some(310.0),
    })
}

#[tokio::test]
async fn pass_syncs_in_drain_order() {
    let executor = RecordingExecutor::default();
    let (_, processor) = setup(RetryPolicy::default(), &executor).await;
    processor.enqueue(workout("low")).await.unwrap();
    processor.enqueue(workout("high").with_priority(3)).await.unwrap();
    processor.enqueue(workout("mid").with_priority(1)).await.unwrap();

    let report = processor.process_pending(USER).await.unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(executor.calls().await, vec!["high", "mid", "low"]);

    let stats = processor.repository().get_statistics(Some(USER)).await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn failure_waits_for_backoff() {
    let executor =
        RecordingExecutor::with_responses(vec![Err(SyncError::Retryable("503".into()))]);
    let (clock, processor) = setup(RetryPolicy::default(), &executor).await;
    let ev = processor.enqueue(workout("run-1")).await.unwrap();

    let first = processor.process_pending(USER).await.unwrap();
    assert_eq!((first.claimed, first.failed), (1, 1));
    let failed = processor.repository().fetch_event(&ev.id).await.unwrap().unwrap();
    assert_eq!(failed.status, EventStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.error_message.unwrap().contains("503"));

    let early = processor.process_pending(USER).await.unwrap();
    assert_eq!((early.claimed, early.deferred), (0, 1));

    clock.advance(Duration::seconds(5));
    let retry = processor.process_pending(USER).await.unwrap();
    assert_eq!(retry.completed, 1);
    let done = processor.repository().fetch_event(&ev.id).await.unwrap().unwrap();
    assert_eq!(done.status, EventStatus::Completed);
    assert_eq!(done.attempt_count, 2);
    assert_eq!(executor.calls().await.len(), 2);
}

#[tokio::test]
async fn exhausted_events_stop_being_claimed() {
    let executor = RecordingExecutor::with_responses(vec![
        Err(SyncError::Terminal("422".into())),
        Err(SyncError::Terminal("422".into())),
    ]);
    let policy = RetryPolicy {
        max_attempts: 2,
        schedule: vec![Duration::zero()],
        ..RetryPolicy::default()
    };
    let (_, processor) = setup(policy, &executor).await;
    processor.enqueue(workout("run-1")).await.unwrap();

    processor.process_pending(USER).await.unwrap();
    let second = processor.process_pending(USER).await.unwrap();
    assert_eq!(second.exhausted, 1);

    let third = processor.process_pending(USER).await.unwrap();
    assert_eq!(third.claimed, 0);
    assert_eq!(executor.calls().await.len(), 2);

    let exhausted = processor
        .repository()
        .fetch_exhausted_events(Some(USER))
        .await
        .unwrap();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].attempt_count, 2);
}

#[tokio::test]
async fn enqueue_coalesces_onto_pending_event() {
    let executor = RecordingExecutor::default();
    let (_, processor) = setup(RetryPolicy::default(), &executor).await;
    let first = processor.enqueue(workout("run-1")).await.unwrap();
    let second = processor
        .enqueue(workout("run-1").update().with_priority(4))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.priority, 4);

    let events = processor
        .repository()
        .fetch_events_for_entity("run-1", None)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].priority, 4);

    processor.process_pending(USER).await.unwrap();
    let third = processor.enqueue(workout("run-1").update()).await.unwrap();
    assert_ne!(third.id, first.id);
    assert!(!third.is_new_record);
}

#[tokio::test]
async fn one_event_per_entity_per_pass() {
    let executor = RecordingExecutor::default();
    let (_, processor) = setup(RetryPolicy::default(), &executor).await;
    let repo = processor.repository();
    repo.create_event(workout("run-1")).await.unwrap();
    repo.create_event(NewEvent::new(EventType::Goal, "run-1", USER))
        .await
        .unwrap();

    let first = processor.process_pending(USER).await.unwrap();
    assert_eq!((first.claimed, first.deferred), (1, 1));
    let second = processor.process_pending(USER).await.unwrap();
    assert_eq!(second.claimed, 1);
}

#[tokio::test]
async fn abandoned_claim_is_recovered() {
    let executor = RecordingExecutor::default();
    let (clock, processor) = setup(RetryPolicy::default(), &executor).await;
    let ev = processor.enqueue(workout("run-1")).await.unwrap();
    processor.repository().mark_as_processing(&ev.id).await.unwrap();

    clock.advance(Duration::minutes(6));
    let report = processor.process_pending(USER).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.claimed, 0);
    let failed = processor.repository().fetch_event(&ev.id).await.unwrap().unwrap();
    assert_eq!(failed.status, EventStatus::Failed);

    clock.advance(Duration::seconds(5));
    let report = processor.process_pending(USER).await.unwrap();
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn missing_executor_fails_event() {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    MigrationPlan::standard().migrate(&pool).await.unwrap();
    let repo = Arc::new(OutboxRepository::new(pool, RetryPolicy::default()));
    let processor = OutboxProcessor::new(repo.clone(), ExecutorRegistry::new());
    let ev = processor.enqueue(workout("run-1")).await.unwrap();

    let report = processor.process_pending(USER).await.unwrap();
    assert_eq!(report.failed, 1);
    let failed = repo.fetch_event(&ev.id).await.unwrap().unwrap();
    assert!(failed
        .error_message
        .unwrap()
        .contains("no executor registered for workout"));
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let executor = RecordingExecutor::default();
    let (_, processor) = setup(RetryPolicy::default(), &executor).await;
    processor.enqueue(workout("run-1")).await.unwrap();
    let processor = Arc::new(processor);

    let (tx, rx) = watch::channel(false);
    let worker = processor.clone();
    let handle = tokio::spawn(async move {
        worker
            .run(USER, std::time::Duration::from_millis(10), rx)
            .await
    });

    for _ in 0..100 {
        if !executor.calls().await.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(executor.calls().await, vec!["run-1"]);
}

#[tokio::test]
async fn backoff_does_not_starve_the_batch() {
    let executor =
        RecordingExecutor::with_responses(vec![Err(SyncError::Retryable("503".into()))]);
    let (_, processor) = setup(RetryPolicy::default(), &executor).await;
    let processor = processor.with_batch_size(1);
    processor.enqueue(workout("hi").with_priority(5)).await.unwrap();
    processor.enqueue(workout("lo")).await.unwrap();

    let first = processor.process_pending(USER).await.unwrap();
    assert_eq!((first.claimed, first.failed), (1, 1));

    // "hi" still outranks "lo" but is waiting out its delay
    let second = processor.process_pending(USER).await.unwrap();
    assert_eq!((second.claimed, second.completed), (1, 1));
    assert_eq!(executor.calls().await, vec!["hi", "lo"]);
}

/// Counts how often the processor asks for the time, i.e. how busy it is.
struct CountingClock {
    inner: ManualClock,
    reads: AtomicUsize,
}

impl Clock for CountingClock {
    fn now(&self) -> DateTime<Utc> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.now()
    }
}

#[tokio::test]
async fn blocked_stale_work_does_not_spin() {
    let executor =
        RecordingExecutor::with_responses(vec![Err(SyncError::Retryable("503".into()))]);
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    MigrationPlan::standard().migrate(&pool).await.unwrap();
    let clock = Arc::new(CountingClock {
        inner: ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()),
        reads: AtomicUsize::new(0),
    });
    let policy = RetryPolicy {
        schedule: vec![Duration::seconds(600)],
        ..RetryPolicy::default()
    };
    let repo = Arc::new(OutboxRepository::new(pool, policy).with_clock(clock.clone()));
    let registry = ExecutorRegistry::new().with_fallback(Arc::new(executor.clone()));
    let processor = Arc::new(OutboxProcessor::new(repo.clone(), registry));

    processor.enqueue(workout("run-1")).await.unwrap();
    processor.process_pending(USER).await.unwrap();
    repo.create_event(workout("run-1").update()).await.unwrap();
    // the new event is stale but queued behind the failed one
    clock.inner.advance(Duration::minutes(6));
    assert!(processor.has_overdue_work(USER).await.unwrap());

    let before = clock.reads.load(Ordering::SeqCst);
    let (tx, rx) = watch::channel(false);
    let worker = processor.clone();
    let handle = tokio::spawn(async move {
        worker.run(USER, std::time::Duration::from_secs(60), rx).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    let reads = clock.reads.load(Ordering::SeqCst) - before;
    assert!(reads < 20, "processor polled {reads} times in 300ms");
    assert_eq!(executor.calls().await.len(), 1);
}
