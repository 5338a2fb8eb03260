//! HTTP gateway (EMBP): merges every sub-router and attaches shared state.

use std::sync::Arc;

use axum::Router;

use crate::{AlertEngine, Config};

mod alerts;
mod health;
mod readings;
mod rules;

/// Shared state handed to every handler.
pub type AppState = (Arc<AlertEngine>, Config);

// ---

pub fn router(engine: Arc<AlertEngine>, config: Config) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(alerts::router())
        .merge(rules::router())
        .merge(health::router())
        .with_state((engine, config))
}
