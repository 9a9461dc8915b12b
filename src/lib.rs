//! Overlay Agent
//!
//! A dev-server companion that runs a coding agent against the project the
//! user is looking at in the browser, streams what the agent does to an
//! overlay, and keeps every run undoable.
//!
//! # Architecture
//!
//! - **Server**: Axum-based HTTP server with SSE streaming
//! - **Runtime**: one agent run at a time, superseding on new prompts
//! - **Adapters**: chat-completions (tool loop in-process) and command
//!   (self-contained agent CLI) backends behind one trait
//! - **Undo**: git-backed snapshots around every run
//!
//! # Modules
//!
//! - [`llm`]: provider adapters and the raw event vocabulary
//! - [`normalized`]: event model seen by the overlay
//! - [`runtime`]: run orchestration and management
//! - [`session`]: persisted conversation
//! - [`tools`]: tool catalog for tool-augmented adapters
//! - [`undo`]: undo sessions and restore
//! - [`gate`]: dev-server reload gating

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod api;
pub mod config;
pub mod gate;
pub mod history;
pub mod interaction;
pub mod llm;
pub mod normalized;
pub mod runtime;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod tools;
pub mod undo;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::runtime::{AgentServices, RunManager};

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Run manager (start, supersede, cancel, follow-ups).
    pub runs: Arc<RunManager>,
    /// Process-wide services shared with the runs.
    pub services: Arc<AgentServices>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(services: Arc<AgentServices>, config: Arc<AppConfig>) -> Self {
        Self {
            runs: Arc::new(RunManager::new(Arc::clone(&services))),
            services,
            config,
        }
    }
}
