//! Persistence boundary: write-only access to the external call store.
//!
//! The store schema is opaque to the gateway. Two capabilities are required
//! of any backend: upsert-by-id for call records, and append-with-
//! idempotency-key for the per-call event stream. [`RestStore`] talks to the
//! configured HTTP store; [`MemoryStore`] backs tests.

mod memory;
mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use rest::RestStore;

use crate::carrier::CallDirection;

/// Call lifecycle status, monotonic through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Abandoned,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ringing => "ringing",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The consolidated call record, upserted by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Server-assigned call identifier.
    pub id: String,
    /// Carrier stream identifier, known once media begins.
    pub stream_sid: Option<String>,
    /// Carrier call identifier.
    pub call_sid: Option<String>,
    pub direction: CallDirection,
    pub from_number: String,
    pub to_number: String,
    pub agent_id: Option<String>,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole seconds, defined only at termination.
    pub duration_seconds: Option<i64>,
    pub recording_url: Option<String>,
    /// Transcript fragments concatenated in arrival order.
    pub transcript: String,
    /// Outcome tag, e.g. "completed", "dnc_block", "emergency_stop".
    pub outcome: Option<String>,
    pub sentiment_score: Option<f32>,
    /// Session handovers performed during the call.
    pub resumption_handle_count: u32,
    pub dropped_inbound_frames: u64,
    pub dropped_outbound_frames: u64,
    /// Set when persistence retries were exhausted and the record may be
    /// missing events.
    pub record_only_partial: bool,
}

impl CallRecord {
    pub fn new(
        id: String,
        direction: CallDirection,
        from_number: String,
        to_number: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            stream_sid: None,
            call_sid: None,
            direction,
            from_number,
            to_number,
            agent_id: None,
            status: CallStatus::Pending,
            started_at,
            ended_at: None,
            duration_seconds: None,
            recording_url: None,
            transcript: String::new(),
            outcome: None,
            sentiment_score: None,
            resumption_handle_count: 0,
            dropped_inbound_frames: 0,
            dropped_outbound_frames: 0,
            record_only_partial: false,
        }
    }
}

/// One appended event with its idempotency key `(call_id, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub call_id: String,
    /// Monotonic per-call counter; the idempotency key with `call_id`.
    pub seq: u64,
    /// Event kind: "created", "updated", "transcript", "tool_call",
    /// "dtmf", "ended".
    pub kind: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Errors at the persistence boundary. Never fatal to a call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(String),
    #[error("store rejected the write: HTTP {status}")]
    Rejected { status: u16 },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Write-only store capability injected into the lifecycle recorder.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert or fully replace the record for `record.id`.
    async fn upsert_call(&self, record: &CallRecord) -> StoreResult<()>;

    /// Append one event. Appending the same `(call_id, seq)` twice must
    /// leave exactly one persisted event.
    async fn append_event(&self, event: &StoredEvent) -> StoreResult<()>;
}
