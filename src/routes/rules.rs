use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tracing::error;

use super::AppState;
use crate::models::DbId;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/parameters/{id}/rules", get(active_rules))
}

/// `GET /parameters/{id}/rules` – rules in force right now (read-only).
async fn active_rules(
    Path(parameter_id): Path<DbId>,
    State((engine, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    if !engine.registry().contains_parameter(parameter_id) {
        return (StatusCode::NOT_FOUND, Json("Unknown parameter")).into_response();
    }

    match engine.list_active_rules(parameter_id) {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(e) => {
            error!("Rule lookup for parameter {} failed: {}", parameter_id, e);
            (StatusCode::SERVICE_UNAVAILABLE, Json("Rule store unavailable")).into_response()
        }
    }
}
