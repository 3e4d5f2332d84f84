//! Serializable I/O types shared by activities, signals and queries.
//!
//! Everything here crosses the event-log boundary (activity inputs and
//! outputs, signal payloads, terminal outcomes), so it must implement
//! `Serialize` + `Deserialize`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Research activity I/O
// ---------------------------------------------------------------------------

/// Input to the `perform_research` activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchInput {
    /// The prompt sent to the language model.
    pub prompt: String,
    /// Model slug (e.g. "gpt-4o").
    pub model: String,
}

// ---------------------------------------------------------------------------
// Report activity I/O
// ---------------------------------------------------------------------------

/// Input to the `create_report` activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderInput {
    /// The approved research text.
    pub content: String,
    /// File name of the rendered artifact.
    pub filename: String,
}

// ---------------------------------------------------------------------------
// Signal payloads
// ---------------------------------------------------------------------------

pub const DECISION_KEEP: &str = "keep";
pub const DECISION_EDIT: &str = "edit";

/// Signal payload carrying the operator's verdict on the latest research.
///
/// The decision is kept as a free-form string: unknown values are legal to
/// send and fail the instance when consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDecision {
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_prompt: Option<String>,
}

impl UserDecision {
    pub fn keep() -> Self {
        Self {
            decision: DECISION_KEEP.to_string(),
            additional_prompt: None,
        }
    }

    pub fn edit(additional_prompt: Option<String>) -> Self {
        Self {
            decision: DECISION_EDIT.to_string(),
            additional_prompt,
        }
    }

    pub fn other(decision: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            additional_prompt: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Instance state exposed to callers
// ---------------------------------------------------------------------------

/// Logical step of a report instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AwaitingResearch,
    AwaitingDecision,
    Finalizing,
    Completed,
    Failed,
}

impl Step {
    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Completed | Step::Failed)
    }
}

/// Terminal result of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { artifact_id: String },
    Failed { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    /// Artifact id on success, human-readable reason on failure.
    pub fn into_result(self) -> Result<String, String> {
        match self {
            Outcome::Succeeded { artifact_id } => Ok(artifact_id),
            Outcome::Failed { reason } => Err(reason),
        }
    }
}

/// Kind of an accumulated context fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Prompt,
    Research,
    Instructions,
}

/// One entry of an instance's accumulated context, in log order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub kind: FragmentKind,
    pub text: String,
}

/// Point-in-time view of an instance, returned by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub step: Step,
    /// Prompt used for the latest research round.
    pub prompt: String,
    /// Latest research text, once a round has completed.
    pub research: Option<String>,
    pub context: Vec<ContextFragment>,
    /// Signal delivered but not yet consumed.
    pub pending_decision: Option<UserDecision>,
    /// Number of research activities scheduled so far.
    pub research_rounds: u32,
    pub result: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    /// Sequence number of the last applied event.
    pub last_seq: u64,
}

impl InstanceSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }
}
