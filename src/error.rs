//! Error taxonomy for the orchestrator.
//!
//! Activity errors are serializable because they are recorded verbatim in
//! `ActivityFailed` events and must survive replay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Terminal outcome of running one activity invocation through the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ActivityError {
    /// The final attempt did not finish within the start-to-close timeout.
    #[error("activity timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Every permitted attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// The invocation was refused without retrying (unknown activity,
    /// undecodable input, or a non-retryable failure from the handler).
    #[error("activity rejected: {0}")]
    Rejected(String),
}

/// Errors about instance state and the per-instance write discipline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("concurrency conflict on {instance_id}: expected seq {expected}, log is at {actual}")]
    ConcurrencyConflict {
        instance_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt history for {instance_id}: {detail}")]
    CorruptHistory { instance_id: String, detail: String },

    #[error("unknown query: {0}")]
    UnknownQuery(String),
}

/// Storage-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by the public orchestrator and gateway surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::State(StateError::ConcurrencyConflict { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::State(StateError::NotFound(_)))
    }
}
