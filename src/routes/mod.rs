//! Route assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{api, control, dial, media};
use crate::state::AppState;

/// Build the full router.
///
/// The media WebSocket path is configurable (default `/twilio`); everything
/// else is fixed. The health check stays unauthenticated; control routes are
/// expected to sit behind the deployment's fronting proxy.
pub fn create_router(state: Arc<AppState>) -> Router {
    let media_path = state.config.media_path.clone();

    Router::new()
        .route("/", get(api::health_check))
        .route(&media_path, get(media::media_handler))
        .route("/dialout", post(dial::dialout_handler))
        .route("/twiml", post(dial::twiml_handler))
        .route("/control/emergency-stop", post(control::emergency_stop_handler))
        .route("/control/agents/:agent_id/toggle", post(control::toggle_agent_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
