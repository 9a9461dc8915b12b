//! Per-run context.

use std::collections::HashSet;
use std::time::Instant;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::llm::AdapterKind;

/// What a caller asks for when starting a run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub prompt: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub creation_mode: bool,
    #[serde(default)]
    pub locale: Option<String>,
}

impl RunRequest {
    #[must_use]
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// One agent invocation.
#[derive(Debug)]
pub struct AgentRun {
    pub id: String,
    pub provider_id: String,
    pub model: String,
    pub adapter_kind: AdapterKind,
    pub prompt: String,
    pub creation_mode: bool,
    pub locale: Option<String>,
    /// Triggered when a newer run supersedes this one.
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

impl AgentRun {
    #[must_use]
    pub fn new(request: RunRequest, provider_id: String, model: String, adapter_kind: AdapterKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider_id,
            model,
            adapter_kind,
            prompt: request.prompt,
            creation_mode: request.creation_mode,
            locale: request.locale,
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn is_self_contained(&self) -> bool {
        self.adapter_kind == AdapterKind::SelfContained
    }
}

/// Mutable flags of a run while its stream is consumed.
#[derive(Debug, Default)]
pub struct RunState {
    /// Native plan mode: text is buffered instead of forwarded.
    pub in_plan_mode: bool,
    /// A plan or question is pending; consumption stops.
    pub waiting_for_input: bool,
    pub reasoning_active: bool,
    /// Guards against a repeated exit-plan-mode marker.
    pub plan_emitted: bool,
    /// Text accumulated while in plan mode.
    pub plan_buffer: String,
    /// Content captured from a plan-file write.
    pub captured_plan: Option<String>,
    pub turns: u32,
    /// Tool-call ids whose results must not be shown.
    pub suppressed: HashSet<String>,
    /// Tool-result ids already forwarded.
    pub results_seen: HashSet<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub saw_usage: bool,
    pub errored: bool,
}
