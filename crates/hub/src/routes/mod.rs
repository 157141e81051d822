//! HTTP routes

pub mod health;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::websocket::ws_handler;

/// Build the relay router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/stats", get(health::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
