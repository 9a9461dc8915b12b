//! Drives one agent run from start to cleanup.
//!
//! The adapter streams on its own task and pushes [`RawEvent`]s through an
//! [`EventSink`]. This side folds them into [`NormalizedEvent`]s, applies the
//! interception rules from [`super::intercept`], and stops consuming as soon
//! as the run needs user input. Cleanup (interaction rejection, undo session,
//! gate) runs exactly once per run whichever way the stream ended.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::intercept::{ToolCallAction, classify_tool_call, is_interaction_tool, parse_plan};
use super::prompt::{PromptContext, build_system_prompt};
use super::run::{AgentRun, RunState};
use super::AgentServices;
use crate::interaction::{PlanProposal, QuestionSet};
use crate::llm::{EventSink, Message, ProviderAdapter, RawEvent, StreamConfig};
use crate::normalized::{NormalizedEvent, ResultSubtype, RunResult};
use crate::tools::ToolBox;

/// Buffer between the adapter task and the consumer.
const RAW_EVENT_BUFFER: usize = 256;

/// How long a paused run waits for the adapter to hand back its messages.
const FINAL_MESSAGES_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a superseded run lets in-flight tool calls settle before the
/// adapter task is dropped.
const SUPERSEDE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Terminal `result` and `done` events were emitted.
    Finished(ResultSubtype),
    /// Cancelled from outside; no terminal events.
    Superseded,
}

/// Why the consume loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The adapter closed its sink.
    Exhausted,
    WaitingForInput,
    Superseded,
}

type AdapterTask = JoinHandle<anyhow::Result<Vec<Message>>>;

/// Run `run` against `adapter` to completion.
#[tracing::instrument(
    skip_all,
    fields(run_id = %run.id, provider = %run.provider_id, model = %run.model)
)]
pub async fn execute(
    services: Arc<AgentServices>,
    adapter: Arc<dyn ProviderAdapter>,
    run: AgentRun,
) -> RunOutcome {
    tracing::info!(name: "run.started", self_contained = run.is_self_contained(), "Run started");

    let mut cleanup = Cleanup::new(&services);
    services.gate.pause();
    services.undo.start(&services.settings.project_dir).await;

    let reset = services
        .session
        .select_model(&run.provider_id, &run.model, |id| {
            services.adapters.is_self_contained(id)
        })
        .await;
    if reset {
        tracing::info!("Session reset for provider switch");
    }
    let messages = services.session.begin_turn(&run.prompt).await;

    let adapter_cancel = run.cancel.child_token();
    let config = stream_config(&services, &run, adapter_cancel.clone());
    let (sink, rx) = EventSink::channel(RAW_EVENT_BUFFER);
    let mut task: AdapterTask =
        tokio::spawn(async move { adapter.stream_response(sink, messages, config).await });

    let mut state = RunState::default();
    let consumed = AssertUnwindSafe(consume(&services, &run, &mut state, rx))
        .catch_unwind()
        .await;

    let end = match consumed {
        Ok(end) => end,
        Err(_) => {
            tracing::error!("Stream loop panicked");
            adapter_cancel.cancel();
            task.abort();
            state.errored = true;
            services.emit(NormalizedEvent::Error {
                message: "Internal error while processing the agent stream".to_string(),
            });
            return finish(&services, &run, &mut state, &mut cleanup, Vec::new()).await;
        }
    };

    if end == StreamEnd::Superseded {
        return supersede(&services, &adapter_cancel, &mut task, &mut cleanup).await;
    }

    if end == StreamEnd::WaitingForInput {
        // Stop the adapter but still take what it produced so far.
        adapter_cancel.cancel();
    }

    let joined = tokio::select! {
        biased;
        () = run.cancel.cancelled() => None,
        joined = tokio::time::timeout(FINAL_MESSAGES_TIMEOUT, &mut task) => Some(joined),
    };

    let final_messages = match joined {
        None => return supersede(&services, &adapter_cancel, &mut task, &mut cleanup).await,
        Some(Err(_elapsed)) => {
            tracing::warn!("Adapter did not return its messages in time");
            task.abort();
            Vec::new()
        }
        Some(Ok(Ok(Ok(messages)))) => messages,
        Some(Ok(Ok(Err(e)))) => {
            if state.waiting_for_input || adapter_cancel.is_cancelled() {
                tracing::debug!(error = %e, "Adapter stopped with an error after cancellation");
            } else if state.errored {
                tracing::warn!(error = %e, "Adapter failed after reporting an error");
            } else {
                tracing::warn!(error = %e, "Adapter failed");
                state.errored = true;
                services.emit(NormalizedEvent::Error {
                    message: e.to_string(),
                });
            }
            Vec::new()
        }
        Some(Ok(Err(join_error))) => {
            tracing::error!(error = %join_error, "Adapter task panicked");
            state.errored = true;
            services.emit(NormalizedEvent::Error {
                message: "The agent backend crashed".to_string(),
            });
            Vec::new()
        }
    };

    finish(&services, &run, &mut state, &mut cleanup, final_messages).await
}

fn stream_config(services: &AgentServices, run: &AgentRun, cancel: CancellationToken) -> StreamConfig {
    let settings = &services.settings;
    let (system_prompt, tools) = if run.is_self_contained() {
        (None, None)
    } else {
        let tool_names = services.tools.names();
        let prompt = build_system_prompt(&PromptContext {
            project_dir: &settings.project_dir,
            dev_server_port: settings.dev_server_port,
            tool_names: &tool_names,
            creation_mode: run.creation_mode,
            locale: run.locale.as_deref(),
        });
        let tools = ToolBox::new(
            services.tools.clone(),
            settings.project_dir.clone(),
            services.interactions.clone(),
            settings.confirm_commands,
            settings.command_timeout,
        );
        (Some(prompt), Some(tools))
    };

    StreamConfig {
        project_dir: settings.project_dir.clone(),
        target_port: settings.dev_server_port,
        cancel,
        creation_mode: run.creation_mode,
        locale: run.locale.clone(),
        model: run.model.clone(),
        system_prompt,
        tools,
    }
}

async fn consume(
    services: &AgentServices,
    run: &AgentRun,
    state: &mut RunState,
    mut rx: mpsc::Receiver<RawEvent>,
) -> StreamEnd {
    let cancel = run.cancel.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return StreamEnd::Superseded,
            next = rx.recv() => {
                let Some(event) = next else {
                    return StreamEnd::Exhausted;
                };
                handle_raw(services, run, state, event);
                if state.waiting_for_input {
                    tracing::debug!("Waiting for user input, pausing the stream");
                    return StreamEnd::WaitingForInput;
                }
            }
        }
    }
}

/// Fold one raw event into run state and normalized output.
fn handle_raw(services: &AgentServices, run: &AgentRun, state: &mut RunState, event: RawEvent) {
    match event {
        RawEvent::TextDelta { text } => {
            if state.in_plan_mode {
                state.plan_buffer.push_str(&text);
            } else if !text.is_empty() {
                services.emit(NormalizedEvent::Text {
                    text,
                    model: run.model.clone(),
                });
            }
        }
        RawEvent::ReasoningStart => {
            if !state.reasoning_active {
                state.reasoning_active = true;
                services.emit(NormalizedEvent::Status {
                    message: "Thinking…".to_string(),
                });
            }
        }
        RawEvent::ReasoningDelta { .. } => {}
        RawEvent::ReasoningEnd => state.reasoning_active = false,
        RawEvent::ToolCall { id, name, input } => handle_tool_call(services, run, state, id, name, input),
        RawEvent::ToolResult {
            id,
            name,
            output,
            is_error,
        } => {
            if state.suppressed.contains(&id) || is_interaction_tool(&name) {
                return;
            }
            if is_error && run.is_self_contained() {
                tracing::debug!(tool = %name, "Dropping backend tool error");
                return;
            }
            if !state.results_seen.insert(id.clone()) {
                return;
            }
            services.emit(NormalizedEvent::ToolResult {
                tool_use_id: id,
                tool: name,
                content: output,
                is_error,
            });
        }
        RawEvent::FinishStep => {
            state.turns += 1;
            if state.in_plan_mode {
                state.plan_buffer.clear();
            }
        }
        RawEvent::Usage {
            input_tokens,
            output_tokens,
        } => {
            state.saw_usage = true;
            state.input_tokens += input_tokens;
            state.output_tokens += output_tokens;
        }
        RawEvent::ConfirmRequested {
            confirm_id,
            tool_name,
            summary,
            details,
        } => services.emit(NormalizedEvent::Confirm {
            confirm_id,
            tool_name,
            summary,
            details,
        }),
        RawEvent::ConfirmResolved {
            confirm_id,
            tool_name,
            summary,
            approved,
        } => services.emit(NormalizedEvent::ConfirmResolved {
            confirm_id,
            tool_name,
            summary,
            resolved: true,
            approved,
        }),
        RawEvent::Error { message } => {
            tracing::warn!(error = %message, "Adapter reported an error");
            state.errored = true;
            services.emit(NormalizedEvent::Error { message });
        }
        RawEvent::Finish => {}
    }
}

fn handle_tool_call(
    services: &AgentServices,
    run: &AgentRun,
    state: &mut RunState,
    id: String,
    name: String,
    input: Value,
) {
    match classify_tool_call(&name, &input, &services.settings.project_dir) {
        ToolCallAction::ProposePlan { title, content } => {
            state.suppressed.insert(id);
            emit_plan(services, run, state, title, content);
        }
        ToolCallAction::AskUser { questions } => {
            state.suppressed.insert(id);
            let handle = services.interactions.questions.register(QuestionSet {
                questions: questions.clone(),
                prompt: run.prompt.clone(),
                provider: run.provider_id.clone(),
                model: run.model.clone(),
            });
            services.emit(NormalizedEvent::Question {
                question_id: handle.id,
                questions,
            });
            state.waiting_for_input = true;
        }
        ToolCallAction::EnterPlanMode => {
            state.suppressed.insert(id);
            state.in_plan_mode = true;
            state.plan_buffer.clear();
        }
        ToolCallAction::ExitPlanMode { plan } => {
            state.suppressed.insert(id);
            state.in_plan_mode = false;
            if state.plan_emitted {
                tracing::debug!("Ignoring repeated exit-plan-mode marker");
                return;
            }
            let buffered = std::mem::take(&mut state.plan_buffer);
            let content = state.captured_plan.take().or(plan).unwrap_or(buffered);
            let (title, body) = parse_plan(&content);
            emit_plan(services, run, state, title, body);
        }
        ToolCallAction::CapturePlanFile { content } => {
            tracing::debug!(tool = %name, "Captured plan file write");
            state.suppressed.insert(id);
            state.captured_plan = Some(content);
        }
        ToolCallAction::Drop => {
            tracing::debug!(tool = %name, "Dropping interaction call without usable input");
            state.suppressed.insert(id);
        }
        ToolCallAction::Forward => services.emit(NormalizedEvent::ToolUse {
            tool: name,
            input,
            id,
        }),
    }
}

fn emit_plan(services: &AgentServices, run: &AgentRun, state: &mut RunState, title: String, content: String) {
    let handle = services.interactions.plans.register(PlanProposal {
        title: title.clone(),
        content: content.clone(),
        prompt: run.prompt.clone(),
        provider: run.provider_id.clone(),
        model: run.model.clone(),
    });
    services.emit(NormalizedEvent::Plan {
        plan_id: handle.id,
        plan_title: title,
        plan_content: content,
    });
    state.plan_emitted = true;
    state.waiting_for_input = true;
}

/// Cancelled from outside: clean up and emit nothing terminal.
async fn supersede(
    services: &AgentServices,
    adapter_cancel: &CancellationToken,
    task: &mut AdapterTask,
    cleanup: &mut Cleanup<'_>,
) -> RunOutcome {
    services.interactions.reject_all_pending();
    adapter_cancel.cancel();
    // Tool calls already issued finish before the undo session is closed.
    if tokio::time::timeout(SUPERSEDE_DRAIN_TIMEOUT, &mut *task).await.is_err() {
        tracing::warn!("Adapter did not stop in time, aborting it");
        task.abort();
    }
    cleanup.close_undo().await;
    cleanup.resume_gate();
    tracing::info!(name: "run.superseded", "Run superseded");
    RunOutcome::Superseded
}

/// Persist, clean up, then emit `result` and `done`.
async fn finish(
    services: &AgentServices,
    run: &AgentRun,
    state: &mut RunState,
    cleanup: &mut Cleanup<'_>,
    final_messages: Vec<Message>,
) -> RunOutcome {
    if !final_messages.is_empty() {
        services.session.append(final_messages).await;
    }

    let file_stats = services.undo.current_session_stats().await;

    services.interactions.confirms.reject_all_pending();
    cleanup.close_undo().await;
    cleanup.resume_gate();

    let subtype = if state.waiting_for_input {
        ResultSubtype::WaitingForInput
    } else if state.errored {
        ResultSubtype::ErrorDuringExecution
    } else {
        ResultSubtype::Success
    };
    let duration_ms = u64::try_from(run.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

    services.emit(NormalizedEvent::Result(RunResult {
        subtype,
        duration_ms,
        num_turns: state.turns,
        is_error: subtype == ResultSubtype::ErrorDuringExecution,
        file_stats,
        input_tokens: state.saw_usage.then_some(state.input_tokens),
        output_tokens: state.saw_usage.then_some(state.output_tokens),
    }));
    let message = match subtype {
        ResultSubtype::Success => "Run complete",
        ResultSubtype::WaitingForInput => "Waiting for input",
        ResultSubtype::ErrorDuringExecution => "Run failed",
    };
    services.emit(NormalizedEvent::Done {
        message: message.to_string(),
    });

    tracing::info!(
        name: "run.finished",
        subtype = ?subtype,
        turns = state.turns,
        duration_ms,
        "Run finished"
    );
    RunOutcome::Finished(subtype)
}

/// Run-end steps that must happen at most once.
struct Cleanup<'a> {
    services: &'a AgentServices,
    undo_closed: bool,
    gate_resumed: bool,
}

impl<'a> Cleanup<'a> {
    fn new(services: &'a AgentServices) -> Self {
        Self {
            services,
            undo_closed: false,
            gate_resumed: false,
        }
    }

    async fn close_undo(&mut self) {
        if std::mem::replace(&mut self.undo_closed, true) {
            return;
        }
        self.services.undo.end().await;
    }

    fn resume_gate(&mut self) {
        if !std::mem::replace(&mut self.gate_resumed, true) {
            self.services.gate.resume();
        }
    }
}
