//! Error types for the outbox, sync executors and credentials.

use crate::model::EventStatus;
use thiserror::Error;

/// Remediation shown to the user when the local store cannot be read at all.
pub const RESET_LOCAL_DATA: &str =
    "local data is unreadable by this version; reset local data to continue";

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition for event {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: EventStatus,
        to: EventStatus,
    },

    #[error("Event not found: {0}")]
    NotFound(String),

    /// Every compatibility fallback failed. Callers must not guess.
    #[error("Local store unrecoverable: {reason}")]
    Unrecoverable { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl OutboxError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, OutboxError::Unrecoverable { .. })
    }

    /// User-facing action for errors that need one.
    pub fn remediation(&self) -> Option<&'static str> {
        self.is_unrecoverable().then_some(RESET_LOCAL_DATA)
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;

/// Failure reported by a sync executor. The outbox records every variant the
/// same way and lets the retry policy decide.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("terminal: {0}")]
    Terminal(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("no executor registered for {0}")]
    NoExecutor(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Retryable(_) | SyncError::Unauthorized)
    }
}

/// Shared by every waiter of a single-flight refresh, hence `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh rejected: {0}")]
    Rejected(String),

    #[error("refresh transport error: {0}")]
    Transport(String),
}
