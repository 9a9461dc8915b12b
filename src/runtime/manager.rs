//! One-run-at-a-time run management and interaction follow-ups.

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::orchestrator::{self, RunOutcome};
use super::run::{AgentRun, RunRequest};
use super::AgentServices;
use crate::interaction::Resolution;
use crate::normalized::{NormalizedEvent, QuestionSpec};

/// A run could not be started or an interaction could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no provider is configured")]
    NoProviders,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("no pending {kind} with id {id}")]
    UnknownInteraction { kind: &'static str, id: String },
}

#[derive(Debug)]
struct ActiveRun {
    id: String,
    cancel: CancellationToken,
    handle: JoinHandle<RunOutcome>,
}

/// Starts, supersedes and cancels agent runs.
#[derive(Debug)]
pub struct RunManager {
    services: Arc<AgentServices>,
    current: Mutex<Option<ActiveRun>>,
}

impl RunManager {
    #[must_use]
    pub fn new(services: Arc<AgentServices>) -> Self {
        Self {
            services,
            current: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn services(&self) -> &Arc<AgentServices> {
        &self.services
    }

    /// Subscribe to live normalized events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NormalizedEvent> {
        self.services.subscribe()
    }

    /// Start a run, superseding the current one.
    ///
    /// The previous run is cancelled and its cleanup awaited before the new
    /// run starts, so two runs never overlap.
    #[instrument(
        skip(self, request),
        fields(run_id = tracing::field::Empty, provider = tracing::field::Empty)
    )]
    pub async fn start(&self, request: RunRequest) -> Result<String, RunError> {
        let services = &self.services;
        if services.adapters.is_empty() {
            return Err(RunError::NoProviders);
        }

        let provider_id = request
            .provider
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| services.settings.default_provider.clone());
        let adapter = services
            .adapters
            .get(&provider_id)
            .ok_or_else(|| RunError::UnknownProvider(provider_id.clone()))?;
        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| services.settings.default_model.clone())
            .unwrap_or_else(|| adapter.default_model().to_string());

        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            if !previous.handle.is_finished() {
                tracing::info!(previous_run_id = %previous.id, "Superseding active run");
            }
            previous.cancel.cancel();
            if let Err(e) = previous.handle.await {
                tracing::error!(error = %e, "Previous run task failed");
            }
        }

        let run = AgentRun::new(request, provider_id, model, adapter.kind());
        let run_id = run.id.clone();
        tracing::Span::current().record("run_id", run_id.as_str());
        tracing::Span::current().record("provider", run.provider_id.as_str());

        let cancel = run.cancel.clone();
        let handle = tokio::spawn(orchestrator::execute(Arc::clone(services), adapter, run));
        *current = Some(ActiveRun {
            id: run_id.clone(),
            cancel,
            handle,
        });

        Ok(run_id)
    }

    /// Cancel the active run, if any.
    ///
    /// Waits for its cleanup, then emits `done`. Returns whether a run was
    /// actually cancelled.
    pub async fn cancel(&self) -> bool {
        let mut current = self.current.lock().await;
        let Some(active) = current.take() else {
            return false;
        };
        if active.handle.is_finished() {
            return false;
        }

        active.cancel.cancel();
        if let Err(e) = active.handle.await {
            tracing::error!(run_id = %active.id, error = %e, "Cancelled run task failed");
        }
        tracing::info!(name: "run.cancelled", run_id = %active.id, "Run cancelled");
        self.services.emit(NormalizedEvent::Done {
            message: "Cancelled".to_string(),
        });
        true
    }

    /// Whether a run is streaming or still cleaning up.
    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Interaction Follow-ups
    // ─────────────────────────────────────────────────────────────────────

    /// Approve a plan and start a run implementing it.
    pub async fn approve_plan(&self, plan_id: &str) -> Result<String, RunError> {
        let plan = self
            .services
            .interactions
            .plans
            .resolve(plan_id, Resolution::Approved(Value::Null))
            .ok_or_else(|| unknown("plan", plan_id))?;

        let mut prompt = format!("The user approved the plan \"{}\". Implement it now.", plan.title);
        if !plan.content.is_empty() {
            let _ = write!(prompt, "\n\n{}", plan.content);
        }
        if !plan.prompt.is_empty() {
            let _ = write!(prompt, "\n\nOriginal request: {}", plan.prompt);
        }

        self.start(RunRequest {
            prompt,
            provider: Some(plan.provider),
            model: Some(plan.model),
            ..RunRequest::default()
        })
        .await
    }

    pub fn reject_plan(&self, plan_id: &str) -> Result<(), RunError> {
        self.services
            .interactions
            .plans
            .resolve(plan_id, Resolution::Rejected)
            .map(drop)
            .ok_or_else(|| unknown("plan", plan_id))
    }

    /// Answer a question set and continue the conversation with the answers.
    pub async fn answer_question(&self, question_id: &str, answers: Value) -> Result<String, RunError> {
        let set = self
            .services
            .interactions
            .questions
            .resolve(question_id, Resolution::Approved(answers.clone()))
            .ok_or_else(|| unknown("question", question_id))?;

        let mut prompt = format_answers(&set.questions, &answers);
        if !set.prompt.is_empty() {
            let _ = write!(prompt, "\nContinue with the original request: {}", set.prompt);
        }

        self.start(RunRequest {
            prompt,
            provider: Some(set.provider),
            model: Some(set.model),
            ..RunRequest::default()
        })
        .await
    }

    pub fn dismiss_question(&self, question_id: &str) -> Result<(), RunError> {
        self.services
            .interactions
            .questions
            .resolve(question_id, Resolution::Rejected)
            .map(drop)
            .ok_or_else(|| unknown("question", question_id))
    }

    /// Answer an execute-confirmation; the waiting tool call resumes.
    pub fn resolve_confirm(&self, confirm_id: &str, approved: bool) -> Result<(), RunError> {
        let resolution = if approved {
            Resolution::Approved(Value::Bool(true))
        } else {
            Resolution::Rejected
        };
        self.services
            .interactions
            .confirms
            .resolve(confirm_id, resolution)
            .map(drop)
            .ok_or_else(|| unknown("confirm", confirm_id))
    }
}

fn unknown(kind: &'static str, id: &str) -> RunError {
    RunError::UnknownInteraction {
        kind,
        id: id.to_string(),
    }
}

/// Render answers for the follow-up prompt.
///
/// `answers` is either an array aligned with `questions` or an object keyed
/// by question text (or header, or index).
fn format_answers(questions: &[QuestionSpec], answers: &Value) -> String {
    let mut out = String::from("Here are my answers to your questions:\n");
    for (idx, q) in questions.iter().enumerate() {
        let answer = match answers {
            Value::Array(list) => list.get(idx),
            Value::Object(map) => map
                .get(&q.question)
                .or_else(|| q.header.as_ref().and_then(|h| map.get(h)))
                .or_else(|| map.get(&idx.to_string())),
            _ => None,
        };
        let rendered = answer.map_or_else(|| "(no answer)".to_string(), render_answer);
        let _ = write!(out, "\n- {}\n  {}\n", q.question, rendered);
    }
    if questions.is_empty() {
        if let Value::String(s) = answers {
            let _ = writeln!(out, "\n{s}");
        }
    }
    out
}

fn render_answer(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(render_answer).collect::<Vec<_>>().join(", "),
        Value::Null => "(no answer)".to_string(),
        other => other.to_string(),
    }
}
