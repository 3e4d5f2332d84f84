//! Durable human-in-the-loop research reports.
//!
//! This crate provides a small event-sourced orchestrator and runs one
//! workflow on it: research a prompt with a language model, let an operator
//! keep or edit the result, then render a report.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  Gateway ── signal / query ──► Orchestrator (one driver task per instance)│
//! │                                   │                                       │
//! │                                   ├─ InstanceState::decide()  (pure)      │
//! │                                   ├─ EventLogStore::append()  (durable)   │
//! │                                   ├─ InstanceState::apply()   (pure)      │
//! │                                   └─ ActivityExecutor::execute()          │
//! │                                        ├─ perform_research → LanguageModel│
//! │                                        └─ create_report → DocumentRenderer│
//! └──────────────────────────────────────────────────────────────────────────┘
//!
//! Recovery: read_all(instance) → replay through apply() → resume; an
//! activity scheduled but never resolved is dispatched again.
//! ```

pub mod activities;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod history;
pub mod orchestrator;
pub mod storage;
pub mod types;
pub mod workflow;

// Re-export key types for convenient access
pub use activities::{DocumentRenderer, LanguageModel, ReportActivities};
pub use config::{AppConfig, ConfigError};
pub use error::{ActivityError, EngineError, StateError, StoreError};
pub use executor::{
    ActivityExecutor, ActivityInvocation, ActivityOptions, ActivityRegistry, RetryPolicy,
};
pub use gateway::Gateway;
pub use history::{Event, EventKind, EventLogStore};
pub use orchestrator::{Orchestrator, RecoveryReport};
pub use storage::{FileEventLog, InMemoryEventLog};
pub use types::{InstanceSnapshot, Outcome, Step, UserDecision};
pub use workflow::{InstanceState, WorkflowSettings};
