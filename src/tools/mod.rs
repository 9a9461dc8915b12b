//! Tools offered to tool-augmented adapters.
//!
//! The catalog is rendered in `OpenAI` function-schema form for the model and
//! executed by the adapter through a [`ToolBox`], which binds the catalog to
//! one run (project directory, cancellation, confirmation registry).

pub mod builtin;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::interaction::Interactions;
use crate::llm::EventSink;

/// Errors a tool call can end with.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("path escapes the project directory: {0}")]
    PathOutsideProject(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the user declined to run this command")]
    Rejected,

    #[error("cancelled")]
    Cancelled,

    #[error("command timed out after {0}s")]
    Timeout(u64),
}

/// Everything a tool may touch while it runs.
#[derive(Debug)]
pub struct ToolContext<'a> {
    pub project_dir: &'a Path,
    pub interactions: &'a Interactions,
    pub sink: &'a EventSink,
    pub cancel: &'a CancellationToken,
    pub confirm_commands: bool,
    pub command_timeout: Duration,
}

impl ToolContext<'_> {
    /// Resolve a tool-supplied path inside the project.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        resolve_in_project(self.project_dir, path)
    }
}

/// A callable tool.
#[async_trait::async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the arguments object.
    fn schema(&self) -> serde_json::Value;

    /// The adapter must stop its loop once this tool has run.
    fn ends_turn(&self) -> bool {
        false
    }

    async fn call(&self, ctx: &ToolContext<'_>, args: serde_json::Value) -> Result<String, ToolError>;
}

/// Named set of tools.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: Arc<BTreeMap<&'static str, Arc<dyn Tool>>>,
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolCatalog {
    #[must_use]
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            tools: Arc::new(tools.into_iter().map(|t| (t.name(), t)).collect()),
        }
    }

    /// The catalog shipped with the server.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(builtin::all())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// Tools in `OpenAI` function schema format.
    #[must_use]
    pub fn openai_tools_json(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.schema()
                    }
                })
            })
            .collect()
    }
}

/// Outcome of one tool call, as fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

/// A catalog bound to one run.
#[derive(Debug, Clone)]
pub struct ToolBox {
    catalog: ToolCatalog,
    project_dir: PathBuf,
    interactions: Interactions,
    confirm_commands: bool,
    command_timeout: Duration,
}

impl ToolBox {
    #[must_use]
    pub fn new(
        catalog: ToolCatalog,
        project_dir: PathBuf,
        interactions: Interactions,
        confirm_commands: bool,
        command_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            project_dir,
            interactions,
            confirm_commands,
            command_timeout,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn ends_turn(&self, name: &str) -> bool {
        self.catalog.get(name).is_some_and(|t| t.ends_turn())
    }

    #[must_use]
    pub fn openai_tools_json(&self) -> Vec<serde_json::Value> {
        self.catalog.openai_tools_json()
    }

    /// Execute a tool; failures become an error outcome for the model.
    #[tracing::instrument(skip(self, args, sink, cancel), fields(tool_name = %name))]
    pub async fn call(
        &self,
        name: &str,
        args: serde_json::Value,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let ctx = ToolContext {
            project_dir: &self.project_dir,
            interactions: &self.interactions,
            sink,
            cancel,
            confirm_commands: self.confirm_commands,
            command_timeout: self.command_timeout,
        };

        let result = match self.catalog.get(name) {
            Some(tool) => tool.call(&ctx, args).await,
            None => Err(ToolError::UnknownTool(name.to_string())),
        };

        match result {
            Ok(content) => {
                tracing::debug!(result_length = content.len(), "Tool call succeeded");
                ToolOutcome {
                    content,
                    is_error: false,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tool call failed");
                ToolOutcome {
                    content: format!("Error: {e}"),
                    is_error: true,
                }
            }
        }
    }
}

/// Lexically resolve `path` against `root`, refusing anything that would
/// land outside it.
pub fn resolve_in_project(root: &Path, path: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(path);
    let relative = if candidate.is_absolute() {
        candidate
            .strip_prefix(root)
            .map_err(|_| ToolError::PathOutsideProject(path.to_string()))?
    } else {
        candidate
    };

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(ToolError::PathOutsideProject(path.to_string()));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::PathOutsideProject(path.to_string()));
            }
        }
    }
    Ok(resolved)
}
