//! Registry of live calls.
//!
//! Serves three needs: per-agent concurrency counts for routing, delivery of
//! operator control commands to running orchestrators, and counters for
//! refused calls that never produce a record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Operator commands deliverable to a live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Terminate the call immediately.
    EmergencyStop,
}

/// Scope of an emergency stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopScope {
    /// Every live call.
    Tenant,
    /// Calls routed to one agent.
    Agent(String),
    /// One call.
    Call(String),
}

struct LiveCall {
    agent_id: String,
    control_tx: mpsc::Sender<ControlCommand>,
}

/// Shared registry of in-flight calls.
#[derive(Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<String, LiveCall>>,
    refused_overloaded: AtomicU64,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call once an agent has been selected for it.
    pub fn register(
        &self,
        call_id: &str,
        agent_id: &str,
        control_tx: mpsc::Sender<ControlCommand>,
    ) {
        self.calls.lock().expect("registry poisoned").insert(
            call_id.to_string(),
            LiveCall {
                agent_id: agent_id.to_string(),
                control_tx,
            },
        );
    }

    /// Remove a call at termination.
    pub fn unregister(&self, call_id: &str) {
        self.calls.lock().expect("registry poisoned").remove(call_id);
    }

    /// Live calls currently routed to `agent_id`.
    pub fn count_for_agent(&self, agent_id: &str) -> usize {
        self.calls
            .lock()
            .expect("registry poisoned")
            .values()
            .filter(|c| c.agent_id == agent_id)
            .count()
    }

    /// Total live calls.
    pub fn total(&self) -> usize {
        self.calls.lock().expect("registry poisoned").len()
    }

    /// Count a call refused for overload; these produce no call record.
    pub fn count_refused_overloaded(&self) {
        self.refused_overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refused_overloaded(&self) -> u64 {
        self.refused_overloaded.load(Ordering::Relaxed)
    }

    /// Deliver an emergency stop to every call in scope. Returns how many
    /// calls were signalled.
    pub fn emergency_stop(&self, scope: &StopScope) -> usize {
        let calls = self.calls.lock().expect("registry poisoned");
        let mut signalled = 0;
        for (call_id, live) in calls.iter() {
            let in_scope = match scope {
                StopScope::Tenant => true,
                StopScope::Agent(agent_id) => &live.agent_id == agent_id,
                StopScope::Call(id) => call_id == id,
            };
            if in_scope && live.control_tx.try_send(ControlCommand::EmergencyStop).is_ok() {
                signalled += 1;
            }
        }
        signalled
    }
}
