//! Dev-server reload channel.
//!
//! Browser tabs subscribe to `/api/dev/events`; the dev server (or a file
//! watcher) posts to `/api/dev/notify`. While an agent run is active the
//! gate holds notifications back and flushes them when the run ends, so the
//! page reloads once instead of on every intermediate write.

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::gate::{BufferedRelay, DevServerGate, GatedConnection};

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/dev/events", get(dev_events))
        .route("/api/dev/notify", post(notify))
        .route("/api/dev/status", get(status))
}

/// Untracks a relay when its SSE stream is dropped.
#[derive(Debug)]
struct TrackedRelay {
    gate: DevServerGate,
    id: String,
}

impl Drop for TrackedRelay {
    fn drop(&mut self) {
        self.gate.untrack_connection(&self.id);
    }
}

async fn dev_events(State(state): State<AppState>) -> impl IntoResponse {
    let gate = state.services.gate.clone();
    let (relay, mut rx) = BufferedRelay::channel();
    let guard = TrackedRelay {
        gate: gate.clone(),
        id: relay.id().to_string(),
    };
    gate.track_connection(relay);
    tracing::debug!(connection_id = %guard.id, paused = gate.is_paused(), "Dev-server client connected");

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(payload) = rx.recv().await {
            yield payload;
        }
    };

    crate::api::sse::build_notification_response(stream)
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    #[serde(default = "default_notification")]
    message: String,
}

fn default_notification() -> String {
    "reload".to_string()
}

#[derive(Debug, Serialize)]
struct NotifyResponse {
    connections: usize,
    paused: bool,
}

/// POST /api/dev/notify - Fan a reload notification out through the gate.
async fn notify(State(state): State<AppState>, Json(req): Json<NotifyRequest>) -> Json<NotifyResponse> {
    let gate = &state.services.gate;
    let connections = gate.broadcast(&req.message);
    Json(NotifyResponse {
        connections,
        paused: gate.is_paused(),
    })
}

async fn status(State(state): State<AppState>) -> Json<NotifyResponse> {
    let gate = &state.services.gate;
    Json(NotifyResponse {
        connections: gate.connection_count(),
        paused: gate.is_paused(),
    })
}
