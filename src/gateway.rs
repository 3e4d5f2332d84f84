//! Signal/query front door for report instances.
//!
//! `Gateway` translates named external requests into orchestrator calls,
//! correlated by instance id. It holds no state of its own.
//!
//! ## Query names
//!
//! | Query                 | Result                                        |
//! |-----------------------|-----------------------------------------------|
//! | `get_research_result` | latest research text, or `null`               |
//! | `status`              | the full [`InstanceSnapshot`]                 |
//! | `history`             | every recorded event, oldest first            |

use serde_json::Value;

use crate::error::{EngineError, StateError};
use crate::orchestrator::Orchestrator;
use crate::types::{InstanceSnapshot, UserDecision};

pub const QUERY_RESEARCH_RESULT: &str = "get_research_result";
pub const QUERY_STATUS: &str = "status";
pub const QUERY_HISTORY: &str = "history";

#[derive(Clone)]
pub struct Gateway {
    orchestrator: Orchestrator,
}

impl Gateway {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Deliver a decision signal. Unknown ids fail with `NotFound`.
    pub async fn signal(&self, instance_id: &str, signal: UserDecision) -> Result<(), EngineError> {
        self.orchestrator.send_signal(instance_id, signal).await
    }

    /// Run a named read-only query.
    pub async fn query(&self, instance_id: &str, name: &str) -> Result<Value, EngineError> {
        match name {
            QUERY_RESEARCH_RESULT => {
                let snapshot = self.orchestrator.query_state(instance_id).await?;
                Ok(snapshot.research.map_or(Value::Null, Value::String))
            }
            QUERY_STATUS => {
                let snapshot = self.orchestrator.query_state(instance_id).await?;
                Ok(to_value(&snapshot))
            }
            QUERY_HISTORY => {
                let events = self.orchestrator.history(instance_id).await?;
                Ok(to_value(&events))
            }
            other => {
                // Unknown ids still report NotFound first.
                self.orchestrator.query_state(instance_id).await?;
                Err(StateError::UnknownQuery(other.to_string()).into())
            }
        }
    }

    /// Typed form of the `status` query.
    pub async fn status(&self, instance_id: &str) -> Result<InstanceSnapshot, EngineError> {
        self.orchestrator.query_state(instance_id).await
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to encode query result");
        Value::Null
    })
}
