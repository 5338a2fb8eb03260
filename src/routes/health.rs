// src/routes/health.rs
//! Health endpoints for the station alert service.
//!
//! - `GET /health` answers without touching any dependency (liveness).
//! - `GET /health/ready` asks storage for row counts, so it fails when the
//!   database is unreachable (readiness).

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::storage::StorageCounts;

/// JSON response body for the health endpoints.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    counts: Option<StorageCounts>,
}

async fn live() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        counts: None,
    })
}

async fn ready(State((engine, _)): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    // ---
    match engine.counts().await {
        Ok(counts) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                counts: Some(counts),
            }),
        ),
        Err(e) => {
            tracing::error!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    counts: None,
                }),
            )
        }
    }
}

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/health", get(live))
        .route("/health/ready", get(ready))
}
