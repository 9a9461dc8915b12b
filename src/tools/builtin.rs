//! Built-in tools.

use std::sync::Arc;

use serde_json::{Value, json};
use walkdir::WalkDir;

use super::{Tool, ToolContext, ToolError};
use crate::interaction::{ConfirmRequest, Resolution};
use crate::llm::RawEvent;
use crate::normalized::QuestionSpec;

/// Largest tool output handed back to the model.
const MAX_OUTPUT_CHARS: usize = 16_000;
const MAX_LISTED_FILES: usize = 400;
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", "dist", ".next", ".overlay-agent"];

pub const PROPOSE_PLAN: &str = "propose_plan";
pub const ASK_USER: &str = "ask_user";

/// Every built-in tool.
pub fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadFile),
        Arc::new(WriteFile),
        Arc::new(ListFiles),
        Arc::new(RunCommand),
        Arc::new(ProposePlan),
        Arc::new(AskUser),
    ]
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string field `{key}`")))
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_CHARS {
        let mut cut = MAX_OUTPUT_CHARS;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n... [truncated]");
    }
    s
}

#[derive(Debug)]
pub struct ReadFile;

#[async_trait::async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 text file from the project."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string", "description": "Path relative to the project root" } },
            "required": ["path"]
        })
    }

    async fn call(&self, ctx: &ToolContext<'_>, args: Value) -> Result<String, ToolError> {
        let rel = str_arg(&args, "path")?;
        let path = ctx.resolve(rel)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ToolError::Io {
                path: rel.to_string(),
                source,
            })?;
        Ok(truncate(content))
    }
}

#[derive(Debug)]
pub struct WriteFile;

#[async_trait::async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a file in the project with the given content."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the project root" },
                "content": { "type": "string", "description": "Full new file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn call(&self, ctx: &ToolContext<'_>, args: Value) -> Result<String, ToolError> {
        let rel = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;
        let path = ctx.resolve(rel)?;
        let io_err = |source| ToolError::Io {
            path: rel.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, content).await.map_err(io_err)?;
        Ok(format!("Wrote {} bytes to {rel}", content.len()))
    }
}

#[derive(Debug)]
pub struct ListFiles;

#[async_trait::async_trait]
impl Tool for ListFiles {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> &'static str {
        "List files under a project directory, skipping build output and dependencies."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the project root (default: root)" },
                "max_depth": { "type": "integer", "minimum": 1, "default": 4 }
            }
        })
    }

    async fn call(&self, ctx: &ToolContext<'_>, args: Value) -> Result<String, ToolError> {
        let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let max_depth = args
            .get("max_depth")
            .and_then(Value::as_u64)
            .and_then(|d| usize::try_from(d).ok())
            .unwrap_or(4);
        let dir = ctx.resolve(rel)?;
        let project_dir = ctx.project_dir.to_path_buf();

        let listing = tokio::task::spawn_blocking(move || {
            let mut files: Vec<String> = WalkDir::new(&dir)
                .max_depth(max_depth)
                .into_iter()
                .filter_entry(|e| {
                    e.depth() == 0
                        || !(e.file_type().is_dir()
                            && SKIPPED_DIRS.iter().any(|s| e.file_name() == *s))
                })
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    e.path()
                        .strip_prefix(&project_dir)
                        .ok()
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                })
                .collect();
            files.sort();
            files
        })
        .await
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let total = listing.len();
        let mut out = listing
            .into_iter()
            .take(MAX_LISTED_FILES)
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_LISTED_FILES {
            out.push_str(&format!("\n... ({} more)", total - MAX_LISTED_FILES));
        }
        if out.is_empty() {
            out = "(no files)".to_string();
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub struct RunCommand;

impl RunCommand {
    /// Ask the user before running; resolves once they answer.
    async fn confirm(ctx: &ToolContext<'_>, command: &str) -> Result<(), ToolError> {
        let request = ConfirmRequest {
            tool_name: "run_command".to_string(),
            summary: command.to_string(),
            details: None,
        };
        let handle = ctx.interactions.confirms.register(request.clone());
        ctx.sink
            .send(RawEvent::ConfirmRequested {
                confirm_id: handle.id.clone(),
                tool_name: request.tool_name.clone(),
                summary: request.summary.clone(),
                details: None,
            })
            .await;

        let approved = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            outcome = handle.outcome => outcome.is_ok_and(|r| r.is_approved()),
        };

        ctx.sink
            .send(RawEvent::ConfirmResolved {
                confirm_id: handle.id,
                tool_name: request.tool_name,
                summary: request.summary,
                approved,
            })
            .await;

        if approved { Ok(()) } else { Err(ToolError::Rejected) }
    }
}

#[async_trait::async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the project directory and return its output."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"]
        })
    }

    async fn call(&self, ctx: &ToolContext<'_>, args: Value) -> Result<String, ToolError> {
        let command = str_arg(&args, "command")?;
        if ctx.confirm_commands {
            Self::confirm(ctx, command).await?;
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(ctx.project_dir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let io_err = |source| ToolError::Io {
            path: command.to_string(),
            source,
        };
        let output = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            out = tokio::time::timeout(ctx.command_timeout, cmd.output()) => out
                .map_err(|_| ToolError::Timeout(ctx.command_timeout.as_secs()))?
                .map_err(io_err)?,
        };

        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Ok(truncate(format!(
            "exit code: {code}\n--- stdout ---\n{}\n--- stderr ---\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

#[derive(Debug)]
pub struct ProposePlan;

#[async_trait::async_trait]
impl Tool for ProposePlan {
    fn name(&self) -> &'static str {
        PROPOSE_PLAN
    }

    fn description(&self) -> &'static str {
        "Propose an implementation plan for the user to review before making changes. \
         The turn ends after this call."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "plan": { "type": "string", "description": "The plan in Markdown" }
            },
            "required": ["plan"]
        })
    }

    fn ends_turn(&self) -> bool {
        true
    }

    async fn call(&self, _ctx: &ToolContext<'_>, args: Value) -> Result<String, ToolError> {
        str_arg(&args, "plan")?;
        Ok("Plan submitted for review. Stop and wait for the user's decision.".to_string())
    }
}

#[derive(Debug)]
pub struct AskUser;

#[async_trait::async_trait]
impl Tool for AskUser {
    fn name(&self) -> &'static str {
        ASK_USER
    }

    fn description(&self) -> &'static str {
        "Ask the user one or more clarifying questions. The turn ends after this call."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": { "type": "string" },
                            "header": { "type": "string" },
                            "options": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "label": { "type": "string" },
                                        "description": { "type": "string" }
                                    },
                                    "required": ["label"]
                                }
                            },
                            "multiSelect": { "type": "boolean" }
                        },
                        "required": ["question"]
                    }
                }
            },
            "required": ["questions"]
        })
    }

    fn ends_turn(&self) -> bool {
        true
    }

    async fn call(&self, _ctx: &ToolContext<'_>, args: Value) -> Result<String, ToolError> {
        let questions: Vec<QuestionSpec> = serde_json::from_value(
            args.get("questions").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        Ok(format!(
            "{} question(s) sent to the user. Stop and wait for the answers.",
            questions.len()
        ))
    }
}
