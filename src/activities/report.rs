//! Document-rendering collaborator used by the report activity.

use std::path::PathBuf;

pub const REPORT_TITLE: &str = "Research Report";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("invalid report filename {0:?}")]
    InvalidFilename(String),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Turns approved research text into a stored artifact.
#[async_trait::async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Render `text` and return the artifact's identifier.
    async fn render(&self, text: &str, filename: &str) -> Result<String, RenderError>;
}

/// Lay out research text as a titled document: one paragraph per
/// blank-line separated block, blank blocks dropped.
pub fn format_report(text: &str) -> String {
    let mut out = format!("# {REPORT_TITLE}\n");
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        out.push('\n');
        out.push_str(paragraph);
        out.push('\n');
    }
    out
}

/// Writes Markdown reports into a directory; the artifact id is the path.
pub struct MarkdownReportRenderer {
    output_dir: PathBuf,
}

impl MarkdownReportRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait::async_trait]
impl DocumentRenderer for MarkdownReportRenderer {
    async fn render(&self, text: &str, filename: &str) -> Result<String, RenderError> {
        let name = std::path::Path::new(filename);
        if filename.is_empty() || name.file_name() != Some(name.as_os_str()) {
            return Err(RenderError::InvalidFilename(filename.to_string()));
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| RenderError::Io {
                path: self.output_dir.clone(),
                source,
            })?;

        let path = self.output_dir.join(filename);
        tokio::fs::write(&path, format_report(text))
            .await
            .map_err(|source| RenderError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::info!(path = %path.display(), "report written");
        Ok(path.display().to_string())
    }
}
