//! Activity implementations for the research-report workflow.
//!
//! Activities are the side-effecting steps that run outside the state
//! machine: the language-model call and the report rendering. Their results
//! are recorded in the event log, so a replayed instance never repeats one
//! that has already completed.

mod model;
mod report;

use std::sync::Arc;

use crate::executor::{ActivityContext, ActivityRegistry, AttemptError};
use crate::types::{RenderInput, ResearchInput};
use crate::workflow::{RENDER_ACTIVITY, RESEARCH_ACTIVITY};

pub use model::{CallError, DEFAULT_BASE_URL, LanguageModel, OpenAiChatModel, StubModel};
pub use report::{
    DocumentRenderer, MarkdownReportRenderer, REPORT_TITLE, RenderError, format_report,
};

/// The collaborators behind the report workflow's activities.
#[derive(Clone)]
pub struct ReportActivities {
    model: Arc<dyn LanguageModel>,
    renderer: Arc<dyn DocumentRenderer>,
    /// Fail the first N render attempts to show retries at work.
    simulated_render_failures: u32,
}

impl ReportActivities {
    pub fn new(model: Arc<dyn LanguageModel>, renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self {
            model,
            renderer,
            simulated_render_failures: 0,
        }
    }

    pub fn with_simulated_render_failures(mut self, failures: u32) -> Self {
        self.simulated_render_failures = failures;
        self
    }

    /// Call the language model with the research prompt.
    pub async fn perform_research(
        &self,
        ctx: ActivityContext,
        input: ResearchInput,
    ) -> Result<String, AttemptError> {
        tracing::info!(
            instance_id = %ctx.instance_id,
            attempt = ctx.attempt,
            model = %input.model,
            "performing research"
        );
        match self.model.complete(&input.prompt, &input.model).await {
            Ok(text) => {
                tracing::info!(
                    instance_id = %ctx.instance_id,
                    chars = text.chars().count(),
                    "research complete"
                );
                Ok(text)
            }
            Err(e) if e.is_retryable() => Err(anyhow::Error::new(e).into()),
            Err(e) => Err(AttemptError::non_retryable(e)),
        }
    }

    /// Render the approved research into a report document.
    pub async fn create_report(
        &self,
        ctx: ActivityContext,
        input: RenderInput,
    ) -> Result<String, AttemptError> {
        if ctx.attempt <= self.simulated_render_failures {
            return Err(anyhow::anyhow!(
                "report creation failed on attempt {} - demonstrating retries",
                ctx.attempt
            )
            .into());
        }
        let artifact = self
            .renderer
            .render(&input.content, &input.filename)
            .await
            .map_err(|e| match e {
                RenderError::InvalidFilename(_) => AttemptError::non_retryable(e),
                RenderError::Io { .. } => anyhow::Error::new(e).into(),
            })?;
        tracing::info!(instance_id = %ctx.instance_id, %artifact, "report created");
        Ok(artifact)
    }

    /// Register both activities under the names the state machine schedules.
    pub fn register(self, registry: &mut ActivityRegistry) {
        let research = self.clone();
        registry.register_fn(RESEARCH_ACTIVITY, move |ctx, input: ResearchInput| {
            let activities = research.clone();
            async move { activities.perform_research(ctx, input).await }
        });
        let render = self;
        registry.register_fn(RENDER_ACTIVITY, move |ctx, input: RenderInput| {
            let activities = render.clone();
            async move { activities.create_report(ctx, input).await }
        });
    }
}
