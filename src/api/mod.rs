// HTTP API routes for matchmaking, match lifecycle, and service status.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::error::MatchmakingError;
use crate::metrics;
use crate::session::{MatchOutcome, MatchService};

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct MatchRequest {
    pub user_id: i64,
}

#[derive(Deserialize)]
pub struct StartMatchRequest {
    pub user_a: i64,
    pub user_b: i64,
}

#[derive(Deserialize)]
pub struct FinishMatchRequest {
    pub match_id: i64,
    pub score: [i32; 2],
}

#[derive(Deserialize)]
pub struct QueueStatusParams {
    pub area: Option<String>,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub service: MatchService,
}

// ── Error helpers ─────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

/// Translate the error taxonomy into status codes: Validation → 400,
/// Not-Found → 404, Conflict → 409, Operational → 503.
fn error_response(e: MatchmakingError) -> axum::response::Response {
    let status = match &e {
        MatchmakingError::Validation(_) => StatusCode::BAD_REQUEST,
        MatchmakingError::NotFound(_) => StatusCode::NOT_FOUND,
        MatchmakingError::Conflict(_) => StatusCode::CONFLICT,
        MatchmakingError::Operational(err) => {
            tracing::error!("store error: {err}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    json_error(status, &e.to_string()).into_response()
}

/// The enqueue endpoints report an unknown user as a bad request rather
/// than a 404 (the path exists; the payload is wrong).
fn enqueue_error_response(e: MatchmakingError) -> axum::response::Response {
    match e {
        MatchmakingError::NotFound(_) => {
            json_error(StatusCode::BAD_REQUEST, "unknown user").into_response()
        }
        other => error_response(other),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(service: MatchService) -> Router {
    let state = AppState { service };

    Router::new()
        // Matchmaking
        .route("/match", post(request_match))
        .route("/match/stream", post(request_match_stream))
        .route("/match/start", post(start_match))
        .route("/match/finish", post(finish_match))
        .route("/match/cancel/{match_id}", get(cancel_match))
        // Status
        .route("/api/matches/{id}", get(get_match))
        .route("/api/queue/status", get(queue_status))
        .route("/api/health", get(health))
        .route("/metrics", get(serve_metrics))
        .with_state(state)
}

// ── Matchmaking handlers ──────────────────────────────────────────────

async fn request_match(
    State(state): State<AppState>,
    Json(req): Json<MatchRequest>,
) -> impl IntoResponse {
    match state.service.match_blocking(req.user_id).await {
        Ok(MatchOutcome::Matched { match_id }) => (
            StatusCode::OK,
            Json(json!({ "status": "matched", "match_id": match_id })),
        )
            .into_response(),
        Ok(MatchOutcome::Expired) => {
            (StatusCode::OK, Json(json!({ "status": "expired" }))).into_response()
        }
        Ok(MatchOutcome::Cancelled) => {
            (StatusCode::OK, Json(json!({ "status": "cancelled" }))).into_response()
        }
        Err(e) => enqueue_error_response(e),
    }
}

async fn request_match_stream(
    State(state): State<AppState>,
    Json(req): Json<MatchRequest>,
) -> impl IntoResponse {
    match state.service.match_stream(req.user_id).await {
        Ok(events) => {
            let stream =
                ReceiverStream::new(events).map(|event| Event::default().json_data(&event));
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Err(e) => enqueue_error_response(e),
    }
}

async fn start_match(
    State(state): State<AppState>,
    Json(req): Json<StartMatchRequest>,
) -> impl IntoResponse {
    match state.service.start_match(req.user_a, req.user_b).await {
        Ok(match_id) => (StatusCode::CREATED, Json(json!({ "match_id": match_id }))).into_response(),
        Err(e) => enqueue_error_response(e),
    }
}

async fn finish_match(
    State(state): State<AppState>,
    Json(req): Json<FinishMatchRequest>,
) -> impl IntoResponse {
    match state.service.finish_match(req.match_id, req.score).await {
        Ok(change) => (
            StatusCode::OK,
            Json(json!({
                "rating_before": change.rating_before,
                "rating_after": change.rating_after,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_match(
    State(state): State<AppState>,
    Path(match_id): Path<i64>,
) -> impl IntoResponse {
    match state.service.cancel_match(match_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Status handlers ───────────────────────────────────────────────────

async fn get_match(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.service.get_match(id).await {
        Ok(row) => (StatusCode::OK, Json(json!(row))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn queue_status(
    State(state): State<AppState>,
    Query(params): Query<QueueStatusParams>,
) -> impl IntoResponse {
    let area = params.area.unwrap_or_else(|| "global".to_string());
    match state.service.queue_status(&area).await {
        Ok(status) => (StatusCode::OK, Json(json!(status))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn serve_metrics() -> impl IntoResponse {
    metrics::gather_metrics()
}
