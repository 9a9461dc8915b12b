//! Normalized event types streamed to the overlay client.
//!
//! Every provider adapter produces its own raw event vocabulary
//! ([`crate::llm::RawEvent`]). The run orchestrator folds those into the
//! [`NormalizedEvent`] catalog defined here, which is the only shape the
//! browser overlay ever sees.
//!
//! # Event Types
//!
//! - Transient progress (`status`)
//! - Assistant output (`text`)
//! - Tool lifecycle (`tool_use`, `tool_result`)
//! - Interaction points (`plan`, `question`, `confirm`, `confirm_resolved`)
//! - Run termination (`result`, `error`, `done`)
//!
//! # Example
//!
//! ```rust
//! use overlay_agent::normalized::{NormalizedEvent, sse_event};
//!
//! let event = NormalizedEvent::Text {
//!     text: "Hello".to_string(),
//!     model: "gpt-4o".to_string(),
//! };
//! let sse = sse_event(&event);
//! assert!(sse.starts_with("event: text\n"));
//! ```

use serde::{Deserialize, Serialize};

/// One clarifying question asked by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionSpec {
    /// The question text.
    pub question: String,
    /// Short label shown above the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    /// Suggested answers, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
    /// Whether more than one option may be picked.
    #[serde(default, rename = "multiSelect")]
    pub multi_select: bool,
}

/// A suggested answer for a [`QuestionSpec`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Per-file line statistics for the files an agent run touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStat {
    pub path: String,
    pub additions: usize,
    pub deletions: usize,
}

/// Aggregated file statistics attached to a `result` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStats {
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
    pub files: Vec<FileStat>,
}

impl FileStats {
    /// Sum a list of per-file stats.
    #[must_use]
    pub fn from_files(files: Vec<FileStat>) -> Self {
        Self {
            files_changed: files.len(),
            additions: files.iter().map(|f| f.additions).sum(),
            deletions: files.iter().map(|f| f.deletions).sum(),
            files,
        }
    }
}

/// How a run ended, as reported in the `result` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    WaitingForInput,
    ErrorDuringExecution,
}

/// Payload of the terminal `result` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub subtype: ResultSubtype,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_stats: Option<FileStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Normalized events emitted by the run orchestrator.
///
/// Serialized with an internal `type` tag so every kind has one flat schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    // ─────────────────────────────────────────────────────────────────────
    // Progress and Output
    // ─────────────────────────────────────────────────────────────────────
    /// Transient progress message (never persisted in history).
    Status { message: String },

    /// Assistant text fragment.
    Text { text: String, model: String },

    // ─────────────────────────────────────────────────────────────────────
    // Tool Calls
    // ─────────────────────────────────────────────────────────────────────
    /// The agent invoked a tool.
    ToolUse {
        tool: String,
        input: serde_json::Value,
        id: String,
    },

    /// A tool finished.
    ToolResult {
        tool_use_id: String,
        tool: String,
        content: String,
        is_error: bool,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Interaction Points
    // ─────────────────────────────────────────────────────────────────────
    /// A plan awaits user review.
    Plan {
        #[serde(rename = "planId")]
        plan_id: String,
        #[serde(rename = "planTitle")]
        plan_title: String,
        #[serde(rename = "planContent")]
        plan_content: String,
    },

    /// The agent asked clarifying questions.
    Question {
        #[serde(rename = "questionId")]
        question_id: String,
        questions: Vec<QuestionSpec>,
    },

    /// A tool is waiting for execute-confirmation.
    Confirm {
        #[serde(rename = "confirmId")]
        confirm_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// An execute-confirmation was answered (or torn down).
    ConfirmResolved {
        #[serde(rename = "confirmId")]
        confirm_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        summary: String,
        resolved: bool,
        approved: bool,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Termination
    // ─────────────────────────────────────────────────────────────────────
    /// Final accounting for a run.
    Result(RunResult),

    /// A provider or transport error.
    Error { message: String },

    /// The run is over.
    Done { message: String },
}

impl NormalizedEvent {
    /// Events that only matter while a client is watching live.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Status { .. } | Self::Done { .. })
    }
}

/// Convert a [`NormalizedEvent`] to an SSE-formatted string.
///
/// The output follows the Server-Sent Events specification with both
/// an `event:` line (for `EventSource` listeners) and a `data:` line
/// containing the JSON payload.
pub fn sse_event(evt: &NormalizedEvent) -> String {
    let json = event_json(evt);
    let event_name = event_name(evt);

    format!("event: {event_name}\ndata: {json}\n\n")
}

/// Serialize an event, falling back to an `error` payload.
pub fn event_json(evt: &NormalizedEvent) -> String {
    serde_json::to_string(evt).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "message": e.to_string() }).to_string()
    })
}

/// Get the SSE event name for a [`NormalizedEvent`].
pub fn event_name(evt: &NormalizedEvent) -> &'static str {
    match evt {
        NormalizedEvent::Status { .. } => "status",
        NormalizedEvent::Text { .. } => "text",
        NormalizedEvent::ToolUse { .. } => "tool_use",
        NormalizedEvent::ToolResult { .. } => "tool_result",
        NormalizedEvent::Plan { .. } => "plan",
        NormalizedEvent::Question { .. } => "question",
        NormalizedEvent::Confirm { .. } => "confirm",
        NormalizedEvent::ConfirmResolved { .. } => "confirm_resolved",
        NormalizedEvent::Result(_) => "result",
        NormalizedEvent::Error { .. } => "error",
        NormalizedEvent::Done { .. } => "done",
    }
}
