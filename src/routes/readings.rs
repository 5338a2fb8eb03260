use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use tracing::{debug, info};

use super::AppState;
use crate::RawReading;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/readings", post(handler))
}

/// `POST /readings` – ingest one batch.
///
/// Always answers 200 with the batch result; per-reading failures are listed
/// in `rejections` rather than failing the request.
async fn handler(
    State((engine, _config)): State<AppState>,
    Json(readings): Json<Vec<RawReading>>,
) -> impl IntoResponse {
    // ---
    info!("POST /readings - {} readings", readings.len());

    let result = engine.ingest_batch(readings).await;

    debug!(
        "POST /readings - batch {} stored {} rejected {}",
        result.batch_id,
        result.stored_count,
        result.rejected_count()
    );
    (StatusCode::OK, Json(result))
}
