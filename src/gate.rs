//! Dev-server traffic gate.
//!
//! While an agent run edits files, every save would normally trigger a
//! hot-reload in the browser. The gate pauses all reload-carrying
//! connections for the duration of a run and resumes them afterwards, so the
//! page reloads once with every change applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

/// A downstream connection whose delivery can be held back.
pub trait GatedConnection: Send + Sync + std::fmt::Debug {
    /// Stable identifier used for untracking.
    fn id(&self) -> &str;

    /// Stop delivering; buffer instead.
    fn pause(&self);

    /// Deliver everything buffered and continue live.
    fn resume(&self);

    /// Push one notification. Returns `false` once the downstream is gone.
    fn deliver(&self, payload: &str) -> bool;
}

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    connections: HashMap<String, Arc<dyn GatedConnection>>,
}

/// Process-wide gate over all tracked connections.
#[derive(Debug, Clone, Default)]
pub struct DevServerGate {
    state: Arc<Mutex<GateState>>,
}

impl DevServerGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection. It is paused straight away if a run is active.
    pub fn track_connection(&self, conn: Arc<dyn GatedConnection>) {
        let mut state = self.lock();
        if state.paused {
            conn.pause();
        }
        tracing::debug!(connection_id = conn.id(), paused = state.paused, "Tracking dev-server connection");
        state.connections.insert(conn.id().to_string(), conn);
    }

    /// Forget a connection (called when it closes).
    pub fn untrack_connection(&self, id: &str) {
        if self.lock().connections.remove(id).is_some() {
            tracing::debug!(connection_id = id, "Untracked dev-server connection");
        }
    }

    /// Pause every tracked connection. No-op when already paused.
    pub fn pause(&self) {
        let mut state = self.lock();
        if state.paused {
            return;
        }
        state.paused = true;
        for conn in state.connections.values() {
            conn.pause();
        }
        tracing::info!(connections = state.connections.len(), "Dev-server gate paused");
    }

    /// Resume every tracked connection. No-op when not paused.
    pub fn resume(&self) {
        let mut state = self.lock();
        if !state.paused {
            return;
        }
        state.paused = false;
        for conn in state.connections.values() {
            conn.resume();
        }
        tracing::info!(connections = state.connections.len(), "Dev-server gate resumed");
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Fan a reload notification out to every connection, dropping the
    /// ones whose downstream has gone away.
    pub fn broadcast(&self, payload: &str) -> usize {
        let mut state = self.lock();
        state.connections.retain(|id, conn| {
            let alive = conn.deliver(payload);
            if !alive {
                tracing::debug!(connection_id = %id, "Dropping closed dev-server connection");
            }
            alive
        });
        state.connections.len()
    }
}

#[derive(Debug, Default)]
struct RelayState {
    paused: bool,
    buffer: Vec<String>,
}

/// A [`GatedConnection`] that relays notifications into a channel.
///
/// While paused, notifications queue up in memory and are flushed in order
/// on resume.
#[derive(Debug)]
pub struct BufferedRelay {
    id: String,
    state: Mutex<RelayState>,
    downstream: mpsc::UnboundedSender<String>,
}

impl BufferedRelay {
    /// Create a relay and the receiver its notifications arrive on.
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(RelayState::default()),
            downstream: tx,
        });
        (relay, rx)
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of notifications held back.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }
}

impl GatedConnection for BufferedRelay {
    fn id(&self) -> &str {
        &self.id
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn resume(&self) {
        let mut state = self.lock();
        state.paused = false;
        for payload in state.buffer.drain(..) {
            if self.downstream.send(payload).is_err() {
                break;
            }
        }
    }

    fn deliver(&self, payload: &str) -> bool {
        let mut state = self.lock();
        if self.downstream.is_closed() {
            return false;
        }
        if state.paused {
            state.buffer.push(payload.to_string());
            true
        } else {
            self.downstream.send(payload.to_string()).is_ok()
        }
    }
}
