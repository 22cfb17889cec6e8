//! Axum Router Configuration
//!
//! A health probe and the WebSocket voice endpoint.

use crate::{state::AppState, ws::ws_handler};

use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use std::sync::Arc;

/// Liveness probe for load balancers.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let voice_router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new().route("/health", get(health)).merge(voice_router)
}
