//! Undo endpoints.
//!
//! Every mutating call is refused while a run is active: the run's own undo
//! session is still open and would race the restore.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;

use crate::AppState;
use crate::normalized::FileStats;
use crate::undo::{ClosedSession, FileDiff};

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/undo", post(undo))
        .route("/api/undo/diff", get(latest_diff))
        .route("/api/undo/stack", get(stack))
        .route("/api/undo/stats", get(stats))
}

fn failure(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

#[derive(Debug, Serialize)]
struct UndoResponse {
    success: bool,
    restored: Vec<String>,
}

/// POST /api/undo - Restore the newest session's files.
async fn undo(State(state): State<AppState>) -> Response {
    if state.runs.is_running().await {
        return failure(StatusCode::BAD_REQUEST, "An agent run is in progress");
    }
    match state.services.undo.pop_and_restore().await {
        Some(restored) => {
            tracing::info!(name: "undo.restored", files = restored.len(), "Undo applied");
            Json(UndoResponse {
                success: true,
                restored,
            })
            .into_response()
        }
        None => failure(StatusCode::BAD_REQUEST, "Nothing to undo"),
    }
}

/// GET /api/undo/diff - Baseline vs. disk for the newest session.
async fn latest_diff(State(state): State<AppState>) -> Result<Json<Vec<FileDiff>>, Response> {
    state
        .services
        .undo
        .latest_session_diffs()
        .await
        .map(Json)
        .ok_or_else(|| failure(StatusCode::BAD_REQUEST, "Nothing to undo"))
}

async fn stack(State(state): State<AppState>) -> Json<Vec<ClosedSession>> {
    Json(state.services.undo.stack().await)
}

/// GET /api/undo/stats - Line stats of the run in progress, if any.
async fn stats(State(state): State<AppState>) -> Json<Option<FileStats>> {
    Json(state.services.undo.current_session_stats().await)
}
