use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// Kind of domain record an outbox event synchronizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProgressEntry,
    MoodEntry,
    MealLog,
    Workout,
    Goal,
    Generic,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::ProgressEntry,
        EventType::MoodEntry,
        EventType::MealLog,
        EventType::Workout,
        EventType::Goal,
        EventType::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProgressEntry => "progress_entry",
            EventType::MoodEntry => "mood_entry",
            EventType::MealLog => "meal_log",
            EventType::Workout => "workout",
            EventType::Goal => "goal",
            EventType::Generic => "generic",
        }
    }

    pub fn parse_type(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub const ALL: [EventStatus; 4] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Completed,
        EventStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    /// Strict parse of the canonical spelling written by this crate.
    pub fn parse_status(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// Tolerant parse used when reading rows written by older schema versions,
    /// which stored free-form status text.
    pub fn parse_legacy(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "new" => Some(EventStatus::Pending),
            "processing" | "in_progress" | "inprogress" | "syncing" => {
                Some(EventStatus::Processing)
            }
            "completed" | "complete" | "done" | "synced" => Some(EventStatus::Completed),
            "failed" | "failure" | "error" => Some(EventStatus::Failed),
            _ => None,
        }
    }

    /// Edges of the outbox state machine. `Failed -> Pending` additionally
    /// requires the event to be retryable, which only the caller can judge.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (EventStatus::Pending, EventStatus::Processing)
                | (EventStatus::Processing, EventStatus::Completed)
                | (EventStatus::Processing, EventStatus::Failed)
                | (EventStatus::Failed, EventStatus::Pending)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, EventStatus::Pending | EventStatus::Processing)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific fields carried with an event so executors can make
/// lightweight remote calls without re-reading the full record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventMetadata {
    ProgressEntry {
        metric_type: String,
        value: f64,
        unit: String,
    },
    MoodEntry {
        score: i32,
        note: Option<String>,
    },
    MealLog {
        calories: f64,
        protein_g: f64,
        carbs_g: f64,
        fat_g: f64,
    },
    Workout {
        activity: String,
        duration_secs: u64,
        calories: Option<f64>,
    },
    Goal {
        goal_type: String,
        target_value: f64,
    },
    Generic(BTreeMap<String, String>),
}

impl EventMetadata {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEvent {
    pub id: String,
    pub event_type: EventType,
    pub entity_id: String,
    pub user_id: String,
    pub is_new_record: bool,
    pub metadata: Option<EventMetadata>,
    pub status: EventStatus,
    pub attempt_count: u32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl OutboxEvent {
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.status == EventStatus::Failed && self.attempt_count < max_attempts
    }

    /// Failed with no attempts left; must be surfaced, never retried silently.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status == EventStatus::Failed && self.attempt_count >= max_attempts
    }

    /// Only pending events go stale; a claimed event is never flagged here.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == EventStatus::Pending && now - self.created_at > threshold
    }
}

/// Parameters for a new outbox event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub entity_id: String,
    pub user_id: String,
    pub is_new_record: bool,
    pub metadata: Option<EventMetadata>,
    pub priority: i32,
}

impl NewEvent {
    pub fn new(event_type: EventType, entity_id: &str, user_id: &str) -> Self {
        Self {
            event_type,
            entity_id: entity_id.to_string(),
            user_id: user_id.to_string(),
            is_new_record: true,
            metadata: None,
            priority: 0,
        }
    }

    pub fn update(mut self) -> Self {
        self.is_new_record = false;
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A locally persisted domain record, referenced by outbox events through
/// `entity_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainRecord {
    pub entity_id: String,
    pub user_id: String,
    pub record_type: EventType,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Counts of events per status for one user (or all users).
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OutboxStatistics {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Failed events that have used every attempt.
    pub exhausted: u64,
}

impl OutboxStatistics {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn count(&self, status: EventStatus) -> u64 {
        match status {
            EventStatus::Pending => self.pending,
            EventStatus::Processing => self.processing,
            EventStatus::Completed => self.completed,
            EventStatus::Failed => self.failed,
        }
    }

    pub(crate) fn add(&mut self, status: EventStatus, n: u64) {
        match status {
            EventStatus::Pending => self.pending += n,
            EventStatus::Processing => self.processing += n,
            EventStatus::Completed => self.completed += n,
            EventStatus::Failed => self.failed += n,
        }
    }
}

pub const DEFAULT_RETRY_SCHEDULE_SECS: [u64; 5] = [1, 5, 30, 120, 600];
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 300;
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Retry, staleness and retention knobs for the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub schedule: Vec<Duration>,
    pub stale_after: Duration,
    pub retention: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            schedule: DEFAULT_RETRY_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::seconds(*s as i64))
                .collect(),
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS as i64),
            retention: Duration::days(DEFAULT_RETENTION_DAYS as i64),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, indexed by `min(attempt_count, len - 1)`.
    pub fn next_retry_delay(&self, attempt_count: u32) -> Duration {
        if self.schedule.is_empty() {
            return Duration::zero();
        }
        let idx = (attempt_count as usize).min(self.schedule.len() - 1);
        self.schedule[idx]
    }

    /// Whether a retryable failed event has waited out its backoff.
    pub fn is_due(&self, event: &OutboxEvent, now: DateTime<Utc>) -> bool {
        match event.status {
            EventStatus::Pending => true,
            EventStatus::Failed if event.can_retry(self.max_attempts) => {
                let since = event.last_attempt_at.unwrap_or(event.created_at);
                now >= since + self.next_retry_delay(event.attempt_count)
            }
            _ => false,
        }
    }
}

/// Source of "now" for the repository and processor.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock, handy for backoff and staleness scenarios.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Millisecond timestamps are what the store persists.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
