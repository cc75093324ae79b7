//! Status API handlers.
//!
//! Every handler reads from `StateStore` and wraps the result in the
//! `{success, data, error}` envelope.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::ApiState;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Rollouts ───────────────────────────────────────────────────

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_rollouts() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/rollouts/{service}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> impl IntoResponse {
    match state.store.get_rollout(&service) {
        Ok(Some(rollout)) => ApiResponse::ok(rollout).into_response(),
        Ok(None) => {
            error_response("no rollout in progress", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_stable() {
        Ok(envs) => ApiResponse::ok(envs).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/services/{service}/stable
pub async fn get_stable(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> impl IntoResponse {
    match state.store.get_stable(&service) {
        Ok(Some(env)) => ApiResponse::ok(env).into_response(),
        Ok(None) => {
            error_response("no stable environment", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/services/{service}/history?limit=N
pub async fn list_history(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.store.list_history(&service, limit) {
        Ok(history) => ApiResponse::ok(history).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Liveness ───────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
