//! The research-report state machine.
//!
//! An instance's state is a pure fold over its event history:
//!
//! ```text
//!   InstanceStarted ─► AwaitingResearch ──(research ok)──► AwaitingDecision
//!                          ▲                                   │
//!                          └──────────── signal "edit" ◄───────┤
//!                                                              │ signal "keep"
//!                                                              ▼
//!                      Completed ◄──(render ok)──────────── Finalizing
//!
//!   any step ──(activity exhausted | invalid decision | cancel)──► Failed
//! ```
//!
//! [`InstanceState::apply`] folds one committed event into the state and
//! [`InstanceState::decide`] computes what the driver should do next. Neither
//! performs I/O, so replaying the same history always rebuilds the same state.
//!
//! A pending signal is consumed by the event its decision produces: the
//! `ActivityScheduled` for the next research round or the render, or the
//! `InstanceCompleted` for an invalid decision. Consumption is therefore
//! recorded in the log like every other transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ActivityError, StateError};
use crate::executor::{ActivityInvocation, ActivityOptions};
use crate::history::{Event, EventKind};
use crate::types::{
    ContextFragment, DECISION_EDIT, DECISION_KEEP, FragmentKind, InstanceSnapshot, Outcome,
    RenderInput, ResearchInput, Step, UserDecision,
};

pub const RESEARCH_ACTIVITY: &str = "perform_research";
pub const RENDER_ACTIVITY: &str = "create_report";

pub const CANCELLED_REASON: &str = "cancelled";

/// Per-orchestrator settings the state machine needs to build invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub model: String,
    pub research: ActivityOptions,
    pub render: ActivityOptions,
    pub report_filename: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            research: ActivityOptions::default(),
            render: ActivityOptions {
                start_to_close_timeout: std::time::Duration::from_secs(20),
                ..ActivityOptions::default()
            },
            report_filename: "research_report.md".to_string(),
        }
    }
}

/// An activity that has been scheduled but not yet resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledActivity {
    pub scheduled_seq: u64,
    pub invocation: ActivityInvocation,
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Record a new `ActivityScheduled` event.
    Schedule(ActivityInvocation),
    /// Run the scheduled activity and record its result.
    Dispatch(ScheduledActivity),
    /// Suspend until a signal arrives.
    AwaitSignal,
    /// Record `InstanceCompleted`.
    Complete(Outcome),
    /// Terminal; nothing left to do.
    Halt,
}

/// Compose the prompt for another research round.
///
/// Additional instructions are always appended to the *original* prompt;
/// without them the original prompt is reused verbatim.
pub fn compose_prompt(original: &str, additional: Option<&str>) -> String {
    match additional.map(str::trim).filter(|s| !s.is_empty()) {
        Some(extra) => format!("{original}\n\nAdditional instructions: {extra}"),
        None => original.to_string(),
    }
}

/// Report file name for one instance: `<stem>-<instance_id>.<ext>`.
///
/// Characters of the id that are unsafe in a file name become `_`.
pub fn artifact_filename(base: &str, instance_id: &str) -> String {
    let id: String = instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    match base.rfind('.').filter(|&dot| dot > 0) {
        Some(dot) => format!("{}-{id}{}", &base[..dot], &base[dot..]),
        None => format!("{base}-{id}"),
    }
}

/// Both activities of this workflow produce text; anything else is refused
/// before it is recorded.
pub fn validate_output<'a>(
    invocation: &ActivityInvocation,
    output: &'a serde_json::Value,
) -> Result<&'a str, ActivityError> {
    output.as_str().ok_or_else(|| {
        ActivityError::Rejected(format!("{} produced non-text output: {output}", invocation.name))
    })
}

/// Reconstructed state of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub instance_id: String,
    pub original_prompt: String,
    pub current_prompt: String,
    pub model: String,
    pub step: Step,
    pub research: Option<String>,
    pub context: Vec<ContextFragment>,
    pub pending_signal: Option<UserDecision>,
    pub in_flight: Option<ScheduledActivity>,
    pub research_rounds: u32,
    /// Outcome decided by an activity result but not yet recorded.
    pub pending_outcome: Option<Outcome>,
    pub result: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub last_seq: u64,
}

impl InstanceState {
    /// Rebuild state from a full history. The first event must be
    /// `InstanceStarted`.
    pub fn replay(instance_id: &str, events: &[Event]) -> Result<Self, StateError> {
        let (first, rest) = events
            .split_first()
            .ok_or_else(|| StateError::NotFound(instance_id.to_string()))?;

        let mut state = match &first.kind {
            EventKind::InstanceStarted {
                prompt,
                model,
                created_at,
            } => Self {
                instance_id: instance_id.to_string(),
                original_prompt: prompt.clone(),
                current_prompt: prompt.clone(),
                model: model.clone(),
                step: Step::AwaitingResearch,
                research: None,
                context: vec![ContextFragment {
                    kind: FragmentKind::Prompt,
                    text: prompt.clone(),
                }],
                pending_signal: None,
                in_flight: None,
                research_rounds: 0,
                pending_outcome: None,
                result: None,
                created_at: *created_at,
                last_seq: first.seq,
            },
            other => {
                return Err(corrupt(
                    instance_id,
                    format!("history starts with {} instead of instance_started", other.name()),
                ));
            }
        };

        for event in rest {
            state.apply(event)?;
        }
        Ok(state)
    }

    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }

    /// Fold one committed event into the state.
    pub fn apply(&mut self, event: &Event) -> Result<(), StateError> {
        if event.seq != self.last_seq + 1 {
            return Err(self.corrupt(format!(
                "event seq {} does not follow {}",
                event.seq, self.last_seq
            )));
        }
        // Advances even if the event is rejected below, so the instance's
        // failure can still be recorded after it.
        self.last_seq = event.seq;

        match &event.kind {
            EventKind::InstanceStarted { .. } => {
                return Err(self.corrupt("duplicate instance_started".to_string()));
            }
            EventKind::ActivityScheduled { invocation } => {
                self.apply_scheduled(event.seq, invocation)?;
            }
            EventKind::ActivityCompleted {
                scheduled_seq,
                output,
            } => {
                let Some(scheduled) = self.take_in_flight(*scheduled_seq) else {
                    return Ok(());
                };
                self.apply_completed(&scheduled, output)?;
            }
            EventKind::ActivityFailed {
                scheduled_seq,
                error,
            } => {
                let Some(scheduled) = self.take_in_flight(*scheduled_seq) else {
                    return Ok(());
                };
                self.apply_failed(&scheduled, error);
            }
            EventKind::SignalReceived { signal } => {
                // Last write wins; once terminal, signals are history only.
                if !self.is_terminal() {
                    self.pending_signal = Some(signal.clone());
                }
            }
            EventKind::InstanceCompleted { outcome } => {
                if self.is_terminal() {
                    return Err(self.corrupt("instance completed twice".to_string()));
                }
                self.step = if outcome.is_success() {
                    Step::Completed
                } else {
                    Step::Failed
                };
                self.result = Some(outcome.clone());
                self.pending_outcome = None;
                self.pending_signal = None;
                self.in_flight = None;
            }
        }
        Ok(())
    }

    fn apply_scheduled(
        &mut self,
        seq: u64,
        invocation: &ActivityInvocation,
    ) -> Result<(), StateError> {
        if self.is_terminal() || self.in_flight.is_some() {
            return Err(self.corrupt(format!(
                "{} scheduled while {:?} with an activity in flight: {}",
                invocation.name,
                self.step,
                self.in_flight.is_some()
            )));
        }

        match (invocation.name.as_str(), self.step) {
            (RESEARCH_ACTIVITY, Step::AwaitingResearch | Step::AwaitingDecision) => {
                let input: ResearchInput = serde_json::from_value(invocation.input.clone())
                    .map_err(|e| self.corrupt(format!("undecodable research input: {e}")))?;
                if self.step == Step::AwaitingDecision {
                    let signal = self.pending_signal.take();
                    if let Some(extra) = signal
                        .and_then(|s| s.additional_prompt)
                        .filter(|s| !s.trim().is_empty())
                    {
                        self.context.push(ContextFragment {
                            kind: FragmentKind::Instructions,
                            text: extra,
                        });
                    }
                }
                self.current_prompt = input.prompt;
                self.research_rounds += 1;
                self.step = Step::AwaitingResearch;
            }
            (RENDER_ACTIVITY, Step::AwaitingDecision | Step::Finalizing) => {
                self.pending_signal = None;
                self.step = Step::Finalizing;
            }
            (name, step) => {
                return Err(self.corrupt(format!("{name} cannot be scheduled in step {step:?}")));
            }
        }

        self.in_flight = Some(ScheduledActivity {
            scheduled_seq: seq,
            invocation: invocation.clone(),
        });
        Ok(())
    }

    fn apply_completed(
        &mut self,
        scheduled: &ScheduledActivity,
        output: &serde_json::Value,
    ) -> Result<(), StateError> {
        let text = match validate_output(&scheduled.invocation, output) {
            Ok(text) => text.to_string(),
            Err(error) => {
                self.apply_failed(scheduled, &error);
                return Ok(());
            }
        };

        match self.step {
            Step::AwaitingResearch => {
                self.context.push(ContextFragment {
                    kind: FragmentKind::Research,
                    text: text.clone(),
                });
                self.research = Some(text);
                self.step = Step::AwaitingDecision;
            }
            Step::Finalizing => {
                self.pending_outcome = Some(Outcome::Succeeded { artifact_id: text });
            }
            step => {
                return Err(self.corrupt(format!("activity completed in step {step:?}")));
            }
        }
        Ok(())
    }

    fn apply_failed(&mut self, scheduled: &ScheduledActivity, error: &ActivityError) {
        let reason = match scheduled.invocation.name.as_str() {
            RESEARCH_ACTIVITY => format!("research failed: {error}"),
            RENDER_ACTIVITY => format!("render failed: {error}"),
            other => format!("{other} failed: {error}"),
        };
        self.pending_outcome = Some(Outcome::Failed { reason });
    }

    /// Results for anything other than the in-flight activity are stale
    /// (e.g. delivered after a cancel) and ignored.
    fn take_in_flight(&mut self, scheduled_seq: u64) -> Option<ScheduledActivity> {
        match &self.in_flight {
            Some(s) if s.scheduled_seq == scheduled_seq => self.in_flight.take(),
            _ => {
                tracing::debug!(
                    instance_id = %self.instance_id,
                    scheduled_seq,
                    "ignoring result for an activity that is not in flight"
                );
                None
            }
        }
    }

    /// Next command for the driver.
    pub fn decide(&self, settings: &WorkflowSettings) -> Command {
        if self.is_terminal() {
            return Command::Halt;
        }
        if let Some(outcome) = &self.pending_outcome {
            return Command::Complete(outcome.clone());
        }
        if let Some(scheduled) = &self.in_flight {
            return Command::Dispatch(scheduled.clone());
        }

        match self.step {
            Step::AwaitingResearch => Command::Schedule(self.research_invocation(
                self.current_prompt.clone(),
                settings,
            )),
            Step::AwaitingDecision => match &self.pending_signal {
                None => Command::AwaitSignal,
                Some(signal) => match signal.decision.as_str() {
                    DECISION_KEEP => Command::Schedule(self.render_invocation(settings)),
                    DECISION_EDIT => Command::Schedule(self.research_invocation(
                        compose_prompt(&self.original_prompt, signal.additional_prompt.as_deref()),
                        settings,
                    )),
                    other => Command::Complete(Outcome::failed(
                        StateError::InvalidDecision(other.to_string()).to_string(),
                    )),
                },
            },
            Step::Finalizing => Command::Schedule(self.render_invocation(settings)),
            Step::Completed | Step::Failed => Command::Halt,
        }
    }

    fn research_invocation(
        &self,
        prompt: String,
        settings: &WorkflowSettings,
    ) -> ActivityInvocation {
        let input = ResearchInput {
            prompt,
            model: self.model.clone(),
        };
        ActivityInvocation {
            name: RESEARCH_ACTIVITY.to_string(),
            input: serde_json::json!(input),
            options: settings.research.clone(),
        }
    }

    fn render_invocation(&self, settings: &WorkflowSettings) -> ActivityInvocation {
        let input = RenderInput {
            content: self.research.clone().unwrap_or_default(),
            filename: artifact_filename(&settings.report_filename, &self.instance_id),
        };
        ActivityInvocation {
            name: RENDER_ACTIVITY.to_string(),
            input: serde_json::json!(input),
            options: settings.render.clone(),
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.instance_id.clone(),
            step: self.step,
            prompt: self.current_prompt.clone(),
            research: self.research.clone(),
            context: self.context.clone(),
            pending_decision: self.pending_signal.clone(),
            research_rounds: self.research_rounds,
            result: self.result.clone(),
            created_at: self.created_at,
            last_seq: self.last_seq,
        }
    }

    fn corrupt(&self, detail: String) -> StateError {
        corrupt(&self.instance_id, detail)
    }
}

fn corrupt(instance_id: &str, detail: String) -> StateError {
    StateError::CorruptHistory {
        instance_id: instance_id.to_string(),
        detail,
    }
}
