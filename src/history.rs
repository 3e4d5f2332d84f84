//! Append-only event history and the store contract behind it.
//!
//! The history is the source of truth for every instance: in-memory state is
//! only ever a fold over it (see [`crate::workflow::InstanceState::replay`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ActivityError, EngineError};
use crate::executor::ActivityInvocation;
use crate::types::{Outcome, UserDecision};

/// One committed entry of an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub instance_id: String,
    /// Per-instance sequence number, starting at 1.
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Tag-specific payload of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    InstanceStarted {
        prompt: String,
        model: String,
        created_at: DateTime<Utc>,
    },
    ActivityScheduled {
        invocation: ActivityInvocation,
    },
    ActivityCompleted {
        /// Sequence number of the matching `ActivityScheduled` event.
        scheduled_seq: u64,
        output: serde_json::Value,
    },
    ActivityFailed {
        scheduled_seq: u64,
        error: ActivityError,
    },
    SignalReceived {
        signal: UserDecision,
    },
    InstanceCompleted {
        outcome: Outcome,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::InstanceStarted { .. } => "instance_started",
            EventKind::ActivityScheduled { .. } => "activity_scheduled",
            EventKind::ActivityCompleted { .. } => "activity_completed",
            EventKind::ActivityFailed { .. } => "activity_failed",
            EventKind::SignalReceived { .. } => "signal_received",
            EventKind::InstanceCompleted { .. } => "instance_completed",
        }
    }
}

/// Durable, append-only storage for instance histories.
///
/// `append` is a compare-and-append: the caller passes the sequence number
/// of the last event it has seen (`0` for a new instance) and the store
/// rejects the write with `StateError::ConcurrencyConflict` if the log has
/// moved on. This is what keeps a single writer per instance.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Append `kind` as event `expected_seq + 1` and return the committed
    /// event. The event is durable once this returns.
    async fn append(
        &self,
        instance_id: &str,
        expected_seq: u64,
        kind: EventKind,
    ) -> Result<Event, EngineError>;

    /// Full ordered history; empty for unknown instances.
    async fn read_all(&self, instance_id: &str) -> Result<Vec<Event>, EngineError>;

    /// Events with `seq > after_seq`, in order.
    async fn read_after(
        &self,
        instance_id: &str,
        after_seq: u64,
    ) -> Result<Vec<Event>, EngineError> {
        let events = self.read_all(instance_id).await?;
        Ok(events.into_iter().filter(|e| e.seq > after_seq).collect())
    }

    async fn list_instances(&self) -> Result<Vec<String>, EngineError>;
}
