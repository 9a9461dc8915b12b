use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::AppState;
use crate::api::sse::build_sse_response;
use crate::history::HistoryEntry;
use crate::interaction::{ConfirmRequest, InteractionView, PlanProposal, QuestionSet};
use crate::normalized::NormalizedEvent;
use crate::runtime::{RunError, RunRequest};
use crate::session::SessionState;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/agent/runs", post(create_run))
        .route("/api/agent/cancel", post(cancel_run))
        .route("/api/agent/events", get(stream_events))
        .route("/api/agent/history", get(get_history))
        .route("/api/agent/pending", get(get_pending))
        .route("/api/agent/plans/{id}/approve", post(approve_plan))
        .route("/api/agent/plans/{id}/reject", post(reject_plan))
        .route("/api/agent/questions/{id}/answer", post(answer_question))
        .route("/api/agent/questions/{id}/dismiss", post(dismiss_question))
        .route("/api/agent/confirms/{id}", post(resolve_confirm))
        .route("/api/session", get(get_session).delete(reset_session))
        .route("/api/session/model", put(select_model))
}

fn run_error(e: RunError) -> (StatusCode, String) {
    let status = match &e {
        RunError::NoProviders => StatusCode::SERVICE_UNAVAILABLE,
        RunError::UnknownProvider(_) => StatusCode::BAD_REQUEST,
        RunError::UnknownInteraction { .. } => StatusCode::NOT_FOUND,
    };
    (status, e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Runs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateRunResponse {
    run_id: String,
    stream_url: String,
}

impl CreateRunResponse {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            stream_url: "/api/agent/events".to_string(),
        }
    }
}

/// POST /api/agent/runs - Start a run, superseding the current one.
async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<CreateRunResponse>, (StatusCode, String)> {
    if req.prompt.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "prompt must not be empty".to_string()));
    }
    tracing::info!(
        provider = ?req.provider,
        model = ?req.model,
        creation_mode = req.creation_mode,
        "Received run request"
    );

    let run_id = state.runs.start(req).await.map_err(run_error)?;
    Ok(Json(CreateRunResponse::new(run_id)))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_run(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.runs.cancel().await,
    })
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    replay: bool,
}

/// GET /api/agent/events - Live normalized events, optionally after a replay.
async fn stream_events(State(state): State<AppState>, Query(query): Query<EventsQuery>) -> impl IntoResponse {
    // Subscribe first so nothing falls between the replay and the live feed.
    let rx = state.runs.subscribe();
    let replay: Vec<NormalizedEvent> = if query.replay {
        state.services.history.entries().into_iter().map(|e| e.event).collect()
    } else {
        Vec::new()
    };
    tracing::debug!(replayed = replay.len(), "Client subscribed to agent events");

    let live = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "Event subscriber lagged");
            None
        }
    });

    build_sse_response(tokio_stream::iter(replay).chain(live))
}

async fn get_history(State(state): State<AppState>) -> Json<Vec<HistoryEntry>> {
    Json(state.services.history.entries())
}

// ─────────────────────────────────────────────────────────────────────────────
// Interactions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct PendingResponse {
    plans: Vec<InteractionView<PlanProposal>>,
    questions: Vec<InteractionView<QuestionSet>>,
    confirms: Vec<InteractionView<ConfirmRequest>>,
}

async fn get_pending(State(state): State<AppState>) -> Json<PendingResponse> {
    let interactions = &state.services.interactions;
    Json(PendingResponse {
        plans: interactions.plans.pending(),
        questions: interactions.questions.pending(),
        confirms: interactions.confirms.pending(),
    })
}

#[derive(Debug, Serialize)]
struct FollowUpResponse {
    run_id: String,
}

#[derive(Debug, Serialize)]
struct ResolvedResponse {
    success: bool,
}

async fn approve_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FollowUpResponse>, (StatusCode, String)> {
    let run_id = state.runs.approve_plan(&id).await.map_err(run_error)?;
    Ok(Json(FollowUpResponse { run_id }))
}

async fn reject_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResolvedResponse>, (StatusCode, String)> {
    state.runs.reject_plan(&id).map_err(run_error)?;
    Ok(Json(ResolvedResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    answers: serde_json::Value,
}

async fn answer_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<FollowUpResponse>, (StatusCode, String)> {
    let run_id = state
        .runs
        .answer_question(&id, req.answers)
        .await
        .map_err(run_error)?;
    Ok(Json(FollowUpResponse { run_id }))
}

async fn dismiss_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResolvedResponse>, (StatusCode, String)> {
    state.runs.dismiss_question(&id).map_err(run_error)?;
    Ok(Json(ResolvedResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct ConfirmReply {
    approved: bool,
}

async fn resolve_confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmReply>,
) -> Result<Json<ResolvedResponse>, (StatusCode, String)> {
    state
        .runs
        .resolve_confirm(&id, req.approved)
        .map_err(run_error)?;
    Ok(Json(ResolvedResponse { success: true }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

async fn get_session(State(state): State<AppState>) -> Json<SessionState> {
    Json(state.services.session.snapshot().await)
}

async fn reset_session(State(state): State<AppState>) -> StatusCode {
    state.services.session.reset().await;
    state.services.history.clear();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct SelectModelRequest {
    model: String,
    provider: String,
}

#[derive(Debug, Serialize)]
struct SelectModelResponse {
    reset: bool,
}

/// PUT /api/session/model - Switch provider/model; history may be reset.
async fn select_model(
    State(state): State<AppState>,
    Json(req): Json<SelectModelRequest>,
) -> Result<Json<SelectModelResponse>, (StatusCode, String)> {
    let adapters = &state.services.adapters;
    if adapters.get(&req.provider).is_none() {
        return Err(run_error(RunError::UnknownProvider(req.provider)));
    }
    let reset = state
        .services
        .session
        .select_model(&req.provider, &req.model, |id| adapters.is_self_contained(id))
        .await;
    Ok(Json(SelectModelResponse { reset }))
}
