//! Generic activity runner: name lookup, per-attempt timeout, retry with
//! exponential backoff.
//!
//! The executor knows nothing about what an activity does. It resolves the
//! handler registered under the invocation's name and keeps calling it until
//! an attempt succeeds, a failure is classified as non-retryable, or the
//! retry policy runs out.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ActivityError;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Retry policy applied across the attempts of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; `0` means unlimited.
    pub maximum_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    /// Upper bound for a single backoff delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let coefficient = self.backoff_coefficient.max(1.0);
        let secs = self.initial_interval.as_secs_f64() * coefficient.powi(exponent);
        let cap = self
            .maximum_interval
            .unwrap_or_else(|| self.initial_interval.saturating_mul(100));
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        self.maximum_attempts == 0 || attempts_made < self.maximum_attempts
    }
}

/// Options recorded with every scheduled activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Bound on a single attempt.
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// A request to run one named activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInvocation {
    pub name: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Per-attempt information handed to an activity handler.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance_id: String,
    pub activity: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// Failure of a single attempt, as reported by a handler.
#[derive(Debug)]
pub enum AttemptError {
    Retryable { source: anyhow::Error },
    NonRetryable { source: anyhow::Error },
}

impl AttemptError {
    pub fn non_retryable(source: impl Into<anyhow::Error>) -> Self {
        AttemptError::NonRetryable {
            source: source.into(),
        }
    }

    fn message(&self) -> String {
        match self {
            AttemptError::Retryable { source } | AttemptError::NonRetryable { source } => {
                format!("{source:#}")
            }
        }
    }
}

impl From<anyhow::Error> for AttemptError {
    fn from(source: anyhow::Error) -> Self {
        AttemptError::Retryable { source }
    }
}

/// The body of a named activity.
#[async_trait::async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn run(
        &self,
        ctx: ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, AttemptError>;
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type HandlerResult = Result<serde_json::Value, AttemptError>;
type RawFn = dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<HandlerResult> + Send + Sync;

/// Adapts a typed async closure into an [`ActivityHandler`].
struct FnActivity {
    f: Box<RawFn>,
}

#[async_trait::async_trait]
impl ActivityHandler for FnActivity {
    async fn run(
        &self,
        ctx: ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, AttemptError> {
        (self.f)(ctx, input).await
    }
}

/// Name → handler table consulted at dispatch time.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ActivityHandler>,
    ) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Register a typed async function. Input that fails to decode is a
    /// non-retryable failure.
    pub fn register_fn<I, O, F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, AttemptError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let raw = move |ctx: ActivityContext, input: serde_json::Value| {
            let f = Arc::clone(&f);
            let fut: BoxFuture<HandlerResult> = Box::pin(async move {
                let input: I = serde_json::from_value(input).map_err(|e| {
                    let message = anyhow::anyhow!("invalid input for {}: {e}", ctx.activity);
                    AttemptError::non_retryable(message)
                })?;
                let output = f(ctx, input).await?;
                serde_json::to_value(output).map_err(|e| {
                    AttemptError::non_retryable(anyhow::anyhow!("failed to encode output: {e}"))
                })
            });
            fut
        };
        self.register(name, Arc::new(FnActivity { f: Box::new(raw) }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

enum LastFailure {
    Timeout,
    Error(String),
}

/// Runs activity invocations against an [`ActivityRegistry`].
pub struct ActivityExecutor {
    registry: ActivityRegistry,
}

impl ActivityExecutor {
    pub fn new(registry: ActivityRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        instance_id: &str,
        invocation: &ActivityInvocation,
    ) -> Result<serde_json::Value, ActivityError> {
        let handler = self.registry.get(&invocation.name).ok_or_else(|| {
            ActivityError::Rejected(format!("no activity registered as {:?}", invocation.name))
        })?;
        let timeout = invocation.options.start_to_close_timeout;
        let policy = &invocation.options.retry_policy;

        let mut attempt = 1u32;
        loop {
            let ctx = ActivityContext {
                instance_id: instance_id.to_string(),
                activity: invocation.name.clone(),
                attempt,
            };
            let activity = invocation.name.as_str();
            tracing::debug!(instance_id, activity, attempt, "starting activity attempt");

            let run = handler.run(ctx, invocation.input.clone());
            let failure = match tokio::time::timeout(timeout, run).await {
                Ok(Ok(output)) => {
                    tracing::info!(instance_id, activity, attempt, "activity completed");
                    return Ok(output);
                }
                Ok(Err(err @ AttemptError::NonRetryable { .. })) => {
                    tracing::error!(
                        instance_id,
                        activity,
                        attempt,
                        error = %err.message(),
                        "activity rejected"
                    );
                    return Err(ActivityError::Rejected(err.message()));
                }
                Ok(Err(err)) => LastFailure::Error(err.message()),
                Err(_) => LastFailure::Timeout,
            };

            match &failure {
                LastFailure::Error(message) => {
                    tracing::warn!(
                        instance_id,
                        activity,
                        attempt,
                        error = %message,
                        "activity attempt failed"
                    );
                }
                LastFailure::Timeout => {
                    tracing::warn!(
                        instance_id,
                        activity,
                        attempt,
                        ?timeout,
                        "activity attempt timed out"
                    );
                }
            }

            if !policy.allows_another_attempt(attempt) {
                return Err(match failure {
                    LastFailure::Timeout => ActivityError::Timeout { timeout },
                    LastFailure::Error(message) => ActivityError::RetriesExhausted {
                        attempts: attempt,
                        message,
                    },
                });
            }

            tokio::time::sleep(policy.delay_after(attempt)).await;
            attempt += 1;
        }
    }
}
