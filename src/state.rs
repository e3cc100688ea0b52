//! Shared application state.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::call::{CallDeps, CallRegistry, CallTiming, RecorderConfig, StubToolHandler, ToolHandler};
use crate::config::GatewayConfig;
use crate::persistence::{CallStore, RestStore};
use crate::routing::RoutingTable;

/// State shared by every handler and orchestrator.
pub struct AppState {
    pub config: GatewayConfig,
    pub registry: Arc<CallRegistry>,
    pub store: Arc<dyn CallStore>,
    pub tools: Arc<dyn ToolHandler>,
    pub timing: CallTiming,
    pub recorder: RecorderConfig,
    /// Model endpoint override; `None` means the production endpoint.
    pub model_endpoint: Option<String>,
    /// Current routing snapshot. Swapped wholesale on change; readers take
    /// an `Arc` at call start and keep it for the call's lifetime.
    routing: RwLock<Arc<RoutingTable>>,
    /// HTTP client for the carrier's REST dial API.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig, routing: RoutingTable) -> Self {
        let store: Arc<dyn CallStore> =
            Arc::new(RestStore::new(&config.store_url, &config.store_api_key));
        Self::with_store(config, routing, store)
    }

    /// Construct with an explicit store; tests inject a memory store.
    pub fn with_store(
        config: GatewayConfig,
        mut routing: RoutingTable,
        store: Arc<dyn CallStore>,
    ) -> Self {
        // Environment-level DNC entries merge into the table snapshot.
        routing.do_not_call.extend(config.do_not_call.iter().cloned());
        Self {
            config,
            registry: Arc::new(CallRegistry::new()),
            store,
            tools: Arc::new(StubToolHandler),
            timing: CallTiming::default(),
            recorder: RecorderConfig::default(),
            model_endpoint: None,
            routing: RwLock::new(Arc::new(routing)),
            http: reqwest::Client::new(),
        }
    }

    /// The current routing snapshot.
    pub async fn routing_snapshot(&self) -> Arc<RoutingTable> {
        self.routing.read().await.clone()
    }

    /// Replace the routing snapshot.
    pub async fn set_routing(&self, table: RoutingTable) {
        *self.routing.write().await = Arc::new(table);
    }

    /// Flip one agent's active flag. Returns false when the agent is
    /// unknown. In-flight calls keep their snapshot.
    pub async fn toggle_agent(&self, agent_id: &str, active: bool) -> bool {
        let mut guard = self.routing.write().await;
        let mut table = (**guard).clone();
        let Some(agent) = table.agents.iter_mut().find(|a| a.id == agent_id) else {
            return false;
        };
        agent.active = active;
        *guard = Arc::new(table);
        true
    }

    /// Assemble the per-call dependency bundle from the current snapshot.
    pub async fn call_deps(&self) -> CallDeps {
        CallDeps {
            model_api_key: self.config.model_api_key.clone(),
            model_endpoint: self.model_endpoint.clone(),
            routing: self.routing_snapshot().await,
            store: self.store.clone(),
            registry: self.registry.clone(),
            tools: self.tools.clone(),
            timing: self.timing.clone(),
            recorder: self.recorder.clone(),
        }
    }
}
