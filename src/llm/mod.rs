//! Provider adapters.
//!
//! This module defines the contract between the run orchestrator and the
//! language-model backends. An adapter turns one backend into a sequence of
//! [`RawEvent`]s pushed into an [`EventSink`], and resolves with the
//! assistant/tool messages it produced so the session can be continued.
//!
//! # Adapter flavors
//!
//! - [`AdapterKind::ToolAugmented`]: the orchestrator supplies a tool box and
//!   a system prompt ([`ChatCompletionsAdapter`]).
//! - [`AdapterKind::SelfContained`]: the backend owns its own tools and
//!   execution loop and only needs a working directory ([`CommandAdapter`]).
//!
//! [`ScriptedAdapter`] replays a fixed list of events and is used to drive
//! the orchestrator deterministically.

pub mod chat_completions;
pub mod command;
pub mod provider;
pub mod registry;
pub mod scripted;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use chat_completions::ChatCompletionsAdapter;
pub use command::CommandAdapter;
pub use provider::Provider;
pub use registry::AdapterRegistry;
pub use scripted::{Script, ScriptStep, ScriptedAdapter};

use crate::tools::ToolBox;

/// Default upper bound on request/tool round trips in one run.
pub const DEFAULT_MAX_STEPS: usize = 25;

/// Connection and model settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Default model identifier.
    pub model: String,
    /// Provider type (auto-detected from `base_url` if not specified).
    pub provider: Provider,
    /// Whether to enable parallel tool calls (provider-dependent).
    pub parallel_tool_calls: Option<bool>,
    /// Maximum request/tool round trips per run.
    pub max_steps: usize,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// Tool call ID (for tool responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls made by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    /// Assistant turn that requested tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::plain(MessageRole::Assistant, content)
        }
    }

    /// Result of a tool call, fed back to the model.
    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(MessageRole::Tool, content)
        }
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Wire representation for the chat completions API.
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        let mut v = serde_json::json!({ "role": self.role });
        match (&self.tool_calls, self.content.is_empty()) {
            (Some(_), true) => v["content"] = serde_json::Value::Null,
            _ => v["content"] = serde_json::Value::String(self.content.clone()),
        }
        if let Some(calls) = &self.tool_calls {
            v["tool_calls"] = serde_json::to_value(calls).unwrap_or_default();
        }
        if let Some(id) = &self.tool_call_id {
            v["tool_call_id"] = serde_json::Value::String(id.clone());
        }
        v
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Type of tool (always "function" for now).
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

/// Function details in a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

/// Events produced by an adapter, before normalization.
///
/// Self-contained backends emit these as newline-delimited JSON, so the
/// serialized form is part of the command adapter's contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RawEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    ReasoningStart,
    ReasoningDelta {
        text: String,
    },
    ReasoningEnd,
    /// One request/tool round trip finished.
    FinishStep,
    Usage {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
    ConfirmRequested {
        confirm_id: String,
        tool_name: String,
        summary: String,
        #[serde(default)]
        details: Option<String>,
    },
    ConfirmResolved {
        confirm_id: String,
        tool_name: String,
        summary: String,
        approved: bool,
    },
    Error {
        message: String,
    },
    Finish,
}

/// Sending half handed to an adapter.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RawEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the orchestrator consumes.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Push an event. Returns `false` once nobody is consuming, which
    /// adapters treat like cancellation.
    pub async fn send(&self, event: RawEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Per-run context handed to an adapter.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Project the agent works in.
    pub project_dir: PathBuf,
    /// Port of the dev server being overlaid, if known.
    pub target_port: Option<u16>,
    /// Cooperative stop signal.
    pub cancel: CancellationToken,
    /// The user is building a new app rather than editing one.
    pub creation_mode: bool,
    /// Preferred response language.
    pub locale: Option<String>,
    /// Model to use; empty means the adapter default.
    pub model: String,
    /// Ignored by self-contained adapters.
    pub system_prompt: Option<String>,
    /// Ignored by self-contained adapters.
    pub tools: Option<ToolBox>,
}

/// Which side owns the tool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    ToolAugmented,
    SelfContained,
}

/// A language-model backend.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// Flavor of this adapter.
    fn kind(&self) -> AdapterKind;

    /// Model used when a run does not pick one.
    fn default_model(&self) -> &str;

    /// Stream one agent turn.
    ///
    /// Emits zero or more content events followed by exactly one terminal
    /// event ([`RawEvent::Finish`] or [`RawEvent::Error`]), or returns an
    /// error. Resolves with the messages produced by this turn. After
    /// cancellation only complete messages are returned.
    async fn stream_response(
        &self,
        sink: EventSink,
        messages: Vec<Message>,
        config: StreamConfig,
    ) -> anyhow::Result<Vec<Message>>;
}
