use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use tracing::error;

use super::AppState;
use crate::lifecycle::ReadAck;
use crate::models::DbId;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/alerts/{id}/read", post(mark_read))
}

/// `POST /alerts/{id}/read` – idempotent; repeated calls answer 200.
async fn mark_read(
    Path(alert_id): Path<DbId>,
    State((engine, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    match engine.mark_alert_read(alert_id).await {
        Ok(ack @ ReadAck::Ack { .. }) => (StatusCode::OK, Json(ack)).into_response(),
        Ok(ReadAck::NotFound) => (StatusCode::NOT_FOUND, Json(ReadAck::NotFound)).into_response(),
        Err(e) => {
            error!("Failed to mark alert {} read: {}", alert_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json("Failed to update alert"),
            )
                .into_response()
        }
    }
}
