//! Tool-call handling seam.
//!
//! The model may request function executions mid-call. Production
//! deployments register a real handler; the default stub acknowledges every
//! call so the model is never left waiting. The orchestrator enforces a
//! bounded response time and falls back to the stub result on timeout.

use async_trait::async_trait;
use serde_json::Value;

use crate::model::FunctionCall;

/// Handles tool calls requested by the model.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Produce the response payload for one call.
    async fn handle(&self, call: &FunctionCall) -> Value;
}

/// Default handler: acknowledges every tool call.
pub struct StubToolHandler;

impl StubToolHandler {
    /// The acknowledgement payload, also used as the timeout fallback.
    pub fn ok_response() -> Value {
        serde_json::json!({ "result": "ok" })
    }
}

#[async_trait]
impl ToolHandler for StubToolHandler {
    async fn handle(&self, _call: &FunctionCall) -> Value {
        Self::ok_response()
    }
}
