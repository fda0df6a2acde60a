pub mod broadcasts;
pub mod health;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", broadcasts::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Broadcasts
        broadcasts::create_broadcast,
        broadcasts::get_broadcast,
        broadcasts::cancel_broadcast,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Route request/response types
            health::HealthResponse,
            broadcasts::CreateBroadcastRequest,
            broadcasts::CreateBroadcastResponse,
            broadcasts::BroadcastStatus,
            broadcasts::BroadcastStatusResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Broadcasts", description = "Broadcast push to connected clients"),
    )
)]
pub struct ApiDoc;
