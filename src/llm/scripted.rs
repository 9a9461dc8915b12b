//! Deterministic adapter replaying prepared turns.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{AdapterKind, EventSink, Message, ProviderAdapter, RawEvent, StreamConfig};

/// One step of a scripted turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(RawEvent),
    Sleep(Duration),
    /// Block until the run cancels the adapter.
    WaitForCancel,
    /// Resolve with an error.
    Fail(String),
    Panic(String),
}

/// A prepared turn: steps to play and the messages to resolve with.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub steps: Vec<ScriptStep>,
    pub final_messages: Vec<Message>,
}

impl Script {
    /// Emit the given events, then finish.
    #[must_use]
    pub fn events(events: impl IntoIterator<Item = RawEvent>) -> Self {
        Self {
            steps: events.into_iter().map(ScriptStep::Emit).collect(),
            final_messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn then(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn resolving(mut self, messages: Vec<Message>) -> Self {
        self.final_messages = messages;
        self
    }
}

/// What the adapter was called with.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tool_names: Vec<&'static str>,
    pub model: String,
}

#[derive(Debug, Default)]
struct ScriptState {
    turns: VecDeque<Script>,
    calls: Vec<RecordedCall>,
}

/// Adapter that plays back queued [`Script`]s, one per call.
#[derive(Debug, Clone)]
pub struct ScriptedAdapter {
    kind: AdapterKind,
    model: String,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedAdapter {
    #[must_use]
    pub fn new(kind: AdapterKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Queue a turn.
    #[must_use]
    pub fn with_turn(self, script: Script) -> Self {
        self.push_turn(script);
        self
    }

    pub fn push_turn(&self, script: Script) {
        self.lock().turns.push_back(script);
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn stream_response(
        &self,
        sink: EventSink,
        messages: Vec<Message>,
        config: StreamConfig,
    ) -> anyhow::Result<Vec<Message>> {
        let script = {
            let mut state = self.lock();
            state.calls.push(RecordedCall {
                messages,
                system_prompt: config.system_prompt.clone(),
                tool_names: config
                    .tools
                    .as_ref()
                    .map(|t| t.catalog().names())
                    .unwrap_or_default(),
                model: config.model.clone(),
            });
            state
                .turns
                .pop_front()
                .unwrap_or_else(|| Script::events([RawEvent::Finish]))
        };

        for step in script.steps {
            if config.cancel.is_cancelled() {
                break;
            }
            match step {
                ScriptStep::Emit(event) => {
                    if !sink.send(event).await {
                        break;
                    }
                }
                ScriptStep::Sleep(d) => {
                    tokio::select! {
                        () = config.cancel.cancelled() => break,
                        () = tokio::time::sleep(d) => {}
                    }
                }
                ScriptStep::WaitForCancel => {
                    config.cancel.cancelled().await;
                    break;
                }
                ScriptStep::Fail(message) => anyhow::bail!(message),
                ScriptStep::Panic(message) => panic!("{message}"),
            }
        }

        Ok(script.final_messages)
    }
}
