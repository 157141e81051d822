//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::websocket::state::RelayStats;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connections: usize,
    pub producer_connected: bool,
}

/// Health check endpoint
///
/// The relay keeps no external dependencies, so it is healthy whenever it can
/// answer. A missing producer is reported but does not make it unhealthy.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let census = state.relay.registry.census().await;

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connections: census.connections,
            producer_connected: census.producer_connected,
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Connection and routing counters
pub async fn stats(State(state): State<AppState>) -> Json<RelayStats> {
    Json(state.relay.get_stats().await)
}
