//! Agent run runtime.
//!
//! A run takes one user prompt through a provider adapter and turns the
//! adapter's raw events into [`NormalizedEvent`]s for the overlay. Around the
//! stream it coordinates the process-wide services:
//!
//! - the dev-server gate is paused for the whole run
//! - an undo session records what the run changed
//! - the session store keeps the conversation per provider/model
//! - plans, questions and confirmations wait in their registries
//!
//! [`RunManager`] owns the one-run-at-a-time rule; [`orchestrator::execute`]
//! drives a single run.

pub mod intercept;
pub mod manager;
pub mod orchestrator;
pub mod prompt;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::gate::DevServerGate;
use crate::history::HistoryLog;
use crate::interaction::Interactions;
use crate::llm::AdapterRegistry;
use crate::normalized::NormalizedEvent;
use crate::session::SessionStore;
use crate::tools::ToolCatalog;
use crate::undo::UndoCoordinator;

pub use manager::{RunError, RunManager};
pub use orchestrator::RunOutcome;
pub use run::{AgentRun, RunRequest, RunState};

/// Capacity of the client fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-process run defaults.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub project_dir: PathBuf,
    pub dev_server_port: Option<u16>,
    pub default_provider: String,
    pub default_model: Option<String>,
    /// Ask before `run_command` executes.
    pub confirm_commands: bool,
    pub command_timeout: Duration,
    pub locale: Option<String>,
}

impl RunSettings {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            project_dir: config.project.dir.clone(),
            dev_server_port: config.dev_server.port,
            default_provider: config.agent.provider.clone(),
            default_model: config.agent.model.clone().filter(|m| !m.is_empty()),
            confirm_commands: config.agent.confirm_commands,
            command_timeout: config.command_timeout(),
            locale: config.agent.locale.clone(),
        }
    }
}

/// Services shared by every run in the process.
#[derive(Debug)]
pub struct AgentServices {
    pub adapters: AdapterRegistry,
    pub session: SessionStore,
    pub history: HistoryLog,
    pub interactions: Interactions,
    pub undo: UndoCoordinator,
    pub gate: DevServerGate,
    pub tools: ToolCatalog,
    pub settings: RunSettings,
    events: broadcast::Sender<NormalizedEvent>,
}

impl AgentServices {
    /// Bundle the services; registries, gate and fan-out start empty.
    #[must_use]
    pub fn new(
        adapters: AdapterRegistry,
        session: SessionStore,
        history: HistoryLog,
        undo: UndoCoordinator,
        settings: RunSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            adapters,
            session,
            history,
            interactions: Interactions::default(),
            undo,
            gate: DevServerGate::new(),
            tools: ToolCatalog::builtin(),
            settings,
            events,
        }
    }

    /// Record an event in the history and fan it out to live clients.
    pub fn emit(&self, event: NormalizedEvent) {
        self.history.append(&event);
        // No subscriber is fine; the history still has it.
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NormalizedEvent> {
        self.events.subscribe()
    }

    /// Wrap in an [`Arc`] for sharing with the run manager and handlers.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
