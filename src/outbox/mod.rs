//! Outbox: the repository façade over the event store and the processor that
//! drains it through per-event-type sync executors.

pub mod processor;
pub mod repository;

pub use processor::{ExecutorRegistry, OutboxProcessor, PassReport, SyncExecutor};
pub use repository::OutboxRepository;
