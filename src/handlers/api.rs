//! Service-level REST handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// `GET /`: liveness and a couple of operational counters.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "voxgate",
        "version": env!("CARGO_PKG_VERSION"),
        "active_calls": state.registry.total(),
        "refused_overloaded": state.registry.refused_overloaded(),
    }))
}
