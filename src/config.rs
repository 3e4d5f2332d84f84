//! Application configuration: TOML file, then environment overrides.
//!
//! Lookup order for the file: `$RESEARCH_REPORT_CONFIG`, then
//! `research-report.toml` in the working directory, then built-in defaults.
//! Environment variables always win over the file:
//!
//! | Variable               | Field              |
//! |------------------------|--------------------|
//! | `OPENAI_API_KEY`       | `model.api_key`    |
//! | `OPENAI_BASE_URL`      | `model.base_url`   |
//! | `RESEARCH_MODEL`       | `model.name`       |
//! | `RESEARCH_STUB_MODEL`  | `model.stub`       |
//! | `RESEARCH_DATA_DIR`    | `store.dir`        |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::activities::{
    DEFAULT_BASE_URL, DocumentRenderer, LanguageModel, MarkdownReportRenderer, OpenAiChatModel,
    ReportActivities, StubModel,
};
use crate::executor::{ActivityOptions, RetryPolicy};
use crate::workflow::WorkflowSettings;

pub const CONFIG_ENV: &str = "RESEARCH_REPORT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "research-report.toml";

const RESEARCH_TIMEOUT_SECS: u64 = 30;
const RENDER_TIMEOUT_SECS: u64 = 20;

/// Errors loading or validating [`AppConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid config file {path}: {source}")]
    File {
        path: PathBuf,
        source: Box<ConfigError>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub store: StoreConfig,
    pub research: ActivityConfig,
    pub render: ActivityConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Use the offline stub model instead of the API.
    pub stub: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-4o".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            stub: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one event log file per instance.
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".research-report/history"),
        }
    }
}

/// Timeout and retry settings for one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Per-attempt timeout; the activity's own default when unset.
    pub timeout_secs: Option<u64>,
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: Option<u64>,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            max_attempts: 3,
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            max_interval_ms: None,
        }
    }
}

impl ActivityConfig {
    pub fn to_options(&self, default_timeout_secs: u64) -> ActivityOptions {
        ActivityOptions {
            start_to_close_timeout: Duration::from_secs(
                self.timeout_secs.unwrap_or(default_timeout_secs),
            ),
            retry_policy: RetryPolicy {
                maximum_attempts: self.max_attempts,
                initial_interval: Duration::from_millis(self.initial_interval_ms),
                backoff_coefficient: self.backoff_coefficient,
                maximum_interval: self.max_interval_ms.map(Duration::from_millis),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub filename: String,
    pub output_dir: PathBuf,
    /// Fail this many render attempts before succeeding.
    pub simulated_failures: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            filename: "research_report.md".to_string(),
            output_dir: PathBuf::from("."),
            simulated_failures: 0,
        }
    }
}

impl AppConfig {
    /// Load from the configured file (if any) and apply environment
    /// overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from).or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            self.model.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.model.base_url = url;
        }
        if let Some(name) = lookup("RESEARCH_MODEL") {
            self.model.name = name;
        }
        if let Some(stub) = lookup("RESEARCH_STUB_MODEL") {
            let stub = stub.trim().to_ascii_lowercase();
            self.model.stub = matches!(stub.as_str(), "1" | "true" | "yes");
        }
        if let Some(dir) = lookup("RESEARCH_DATA_DIR") {
            self.store.dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, activity) in [("research", &self.research), ("render", &self.render)] {
            if activity.backoff_coefficient < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.backoff_coefficient must be at least 1.0"
                )));
            }
            if activity.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(format!("{name}.timeout_secs must be positive")));
            }
        }
        if self.report.filename.is_empty() {
            return Err(ConfigError::Invalid("report.filename must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            model: self.model.name.clone(),
            research: self.research.to_options(RESEARCH_TIMEOUT_SECS),
            render: self.render.to_options(RENDER_TIMEOUT_SECS),
            report_filename: self.report.filename.clone(),
        }
    }

    pub fn language_model(&self) -> Arc<dyn LanguageModel> {
        if self.model.stub {
            tracing::info!("using the offline stub model");
            return Arc::new(StubModel);
        }
        Arc::new(OpenAiChatModel::new(
            self.model.base_url.clone(),
            self.model.api_key.clone(),
        ))
    }

    pub fn renderer(&self) -> Arc<dyn DocumentRenderer> {
        Arc::new(MarkdownReportRenderer::new(self.report.output_dir.clone()))
    }

    pub fn activities(&self) -> ReportActivities {
        ReportActivities::new(self.language_model(), self.renderer())
            .with_simulated_render_failures(self.report.simulated_failures)
    }
}
