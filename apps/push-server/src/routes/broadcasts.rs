//! Broadcast endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::condition::Condition;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::push::{BroadcastReport, FlowSettings, PushMessage};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/broadcasts", post(create_broadcast))
        .route(
            "/broadcasts/{message_id}",
            get(get_broadcast).delete(cancel_broadcast),
        )
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateBroadcastRequest {
    /// Payload delivered to every matching client.
    #[schema(value_type = Object)]
    pub content: Value,
    /// Targeting predicate; omitted means every connected client.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub condition: Option<Condition>,
    /// Per-pass send ceiling for this broadcast (`0` = unlimited).
    #[serde(default)]
    pub limit: Option<u64>,
    /// Cap on total sends for this broadcast (`0` = no cap).
    #[serde(default)]
    pub max_total: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateBroadcastResponse {
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Running,
    Completed,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BroadcastStatusResponse {
    pub message_id: String,
    pub status: BroadcastStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub report: Option<BroadcastReport>,
}

// ---------------------------------------------------------------------------
// POST /api/v1/broadcasts
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/broadcasts",
    tag = "Broadcasts",
    request_body = CreateBroadcastRequest,
    responses(
        (status = 202, description = "Broadcast accepted", body = CreateBroadcastResponse),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 503, description = "Scheduler unavailable", body = ApiErrorBody),
    ),
)]
pub async fn create_broadcast(
    State(state): State<AppState>,
    Json(body): Json<CreateBroadcastRequest>,
) -> Result<(StatusCode, Json<CreateBroadcastResponse>), ApiError> {
    if body.content.is_null() {
        return Err(ApiError::validation(vec![FieldError {
            field: "content".to_string(),
            message: "content is required".to_string(),
        }]));
    }

    let mut message = PushMessage::new(body.content, body.condition.unwrap_or_default());
    if body.limit.is_some() || body.max_total.is_some() {
        let defaults = state.push.default_flow();
        message = message.with_flow(FlowSettings {
            limit: body.limit.unwrap_or(defaults.limit),
            max_total: body.max_total.unwrap_or(defaults.max_total),
            ..defaults
        });
    }

    let message_id = state.push.broadcast(message)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateBroadcastResponse { message_id }),
    ))
}

// ---------------------------------------------------------------------------
// GET /api/v1/broadcasts/:message_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/broadcasts/{message_id}",
    tag = "Broadcasts",
    params(("message_id" = String, Path, description = "Broadcast message ID")),
    responses(
        (status = 200, description = "Broadcast status", body = BroadcastStatusResponse),
        (status = 404, description = "Unknown broadcast", body = ApiErrorBody),
    ),
)]
pub async fn get_broadcast(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<BroadcastStatusResponse>, ApiError> {
    if let Some(report) = state.reports.get(&message_id) {
        return Ok(Json(BroadcastStatusResponse {
            message_id,
            status: BroadcastStatus::Completed,
            report: Some((*report).clone()),
        }));
    }
    if state.push.is_active(&message_id) {
        return Ok(Json(BroadcastStatusResponse {
            message_id,
            status: BroadcastStatus::Running,
            report: None,
        }));
    }
    Err(ApiError::not_found("Broadcast not found"))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/broadcasts/:message_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/broadcasts/{message_id}",
    tag = "Broadcasts",
    params(("message_id" = String, Path, description = "Broadcast message ID")),
    responses(
        (status = 204, description = "Cancellation requested"),
        (status = 404, description = "No running broadcast with this ID", body = ApiErrorBody),
    ),
)]
pub async fn cancel_broadcast(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.push.cancel(&message_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("No running broadcast with this ID"))
    }
}
