//! Operational control endpoints.
//!
//! Operators can stop live calls (by tenant, agent, or single call) and
//! toggle agents in or out of rotation. Toggling swaps the routing
//! snapshot; in-flight calls keep the configuration they resolved with.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::call::StopScope;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EmergencyStopRequest {
    /// "tenant", "agent", or "call".
    pub scope: String,
    /// Agent or call identifier; required unless scope is "tenant".
    pub id: Option<String>,
}

/// `POST /control/emergency-stop`: terminate live calls in scope.
pub async fn emergency_stop_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmergencyStopRequest>,
) -> impl IntoResponse {
    let scope = match (request.scope.as_str(), request.id) {
        ("tenant", _) => StopScope::Tenant,
        ("agent", Some(id)) => StopScope::Agent(id),
        ("call", Some(id)) => StopScope::Call(id),
        (scope, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("scope \"{scope}\" requires an id") })),
            )
                .into_response()
        }
        (scope, _) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown scope \"{scope}\"") })),
            )
                .into_response()
        }
    };

    let stopped = state.registry.emergency_stop(&scope);
    warn!(?scope, stopped, "emergency stop executed");
    Json(json!({ "stopped": stopped })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub active: bool,
}

/// `POST /control/agents/{id}/toggle`: activate or deactivate an agent.
pub async fn toggle_agent_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(request): Json<ToggleRequest>,
) -> impl IntoResponse {
    if state.toggle_agent(&agent_id, request.active).await {
        Json(json!({ "agent_id": agent_id, "active": request.active })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown agent \"{agent_id}\"") })),
        )
            .into_response()
    }
}
