use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Service version plus the active SQL generator and row limit.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "narapulse-api",
        "generator": state.orchestrator.generator_name(),
        "default_row_limit": state.config.default_row_limit,
    }))
}
