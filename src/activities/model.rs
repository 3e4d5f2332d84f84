//! Language-model collaborator used by the research activity.

use serde::Deserialize;

/// Chat completions endpoint path, relative to the API base URL.
const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Errors from a single model call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("OPENAI_API_KEY not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned no content")]
    EmptyResponse,
}

impl CallError {
    /// Client errors other than rate limiting will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::MissingApiKey => false,
            CallError::Status { status, .. } => *status == 429 || *status >= 500,
            CallError::Http(_) | CallError::EmptyResponse => true,
        }
    }
}

/// Something that turns a prompt into text.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String, CallError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Calls an OpenAI-compatible chat completions API (non-streaming).
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiChatModel {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String, CallError> {
        let api_key = self.api_key.as_deref().ok_or(CallError::MissingApiKey)?;
        let base_url = self.base_url.trim_end_matches('/');
        let url = format!("{base_url}/{CHAT_COMPLETIONS_PATH}");

        tracing::info!(%model, prompt_chars = prompt.len(), %url, "calling chat completions API");

        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(CallError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(CallError::EmptyResponse)?;

        tracing::info!(response_chars = text.len(), "chat completion received");
        Ok(text)
    }
}

/// Offline model that answers with canned text derived from the prompt.
#[derive(Debug, Default, Clone)]
pub struct StubModel;

#[async_trait::async_trait]
impl LanguageModel for StubModel {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String, CallError> {
        Ok(format!(
            "Stub research from {model}.\n\n\
             Your prompt was: '{prompt}'.\n\n\
             Configure an API key and disable the stub model to get real research."
        ))
    }
}
