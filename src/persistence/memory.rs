//! In-memory call store used by tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CallRecord, CallStore, StoreResult, StoredEvent};

/// A store that keeps everything in process memory.
///
/// Appends deduplicate on the `(call_id, seq)` idempotency key, matching
/// the contract real backends must honor.
#[derive(Default)]
pub struct MemoryStore {
    calls: Mutex<HashMap<String, CallRecord>>,
    events: Mutex<HashMap<String, BTreeMap<u64, StoredEvent>>>,
    /// When set, the next N writes fail; used to exercise retry paths.
    failures_remaining: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        *self.failures_remaining.lock().expect("store poisoned") = n;
    }

    /// The stored record for a call, if any.
    pub fn call(&self, id: &str) -> Option<CallRecord> {
        self.calls.lock().expect("store poisoned").get(id).cloned()
    }

    /// All events stored for a call, in sequence order.
    pub fn events(&self, call_id: &str) -> Vec<StoredEvent> {
        self.events
            .lock()
            .expect("store poisoned")
            .get(call_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct calls recorded.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("store poisoned").len()
    }

    fn maybe_fail(&self) -> StoreResult<()> {
        let mut remaining = self.failures_remaining.lock().expect("store poisoned");
        if *remaining > 0 {
            *remaining -= 1;
            return Err(super::StoreError::Transport("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn upsert_call(&self, record: &CallRecord) -> StoreResult<()> {
        self.maybe_fail()?;
        self.calls
            .lock()
            .expect("store poisoned")
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn append_event(&self, event: &StoredEvent) -> StoreResult<()> {
        self.maybe_fail()?;
        self.events
            .lock()
            .expect("store poisoned")
            .entry(event.call_id.clone())
            .or_default()
            .insert(event.seq, event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::CallDirection;
    use crate::persistence::CallStatus;
    use chrono::Utc;

    fn record(id: &str) -> CallRecord {
        CallRecord::new(
            id.to_string(),
            CallDirection::Inbound,
            "+15550001111".into(),
            "+15550002222".into(),
            Utc::now(),
        )
    }

    fn event(call_id: &str, seq: u64) -> StoredEvent {
        StoredEvent {
            call_id: call_id.to_string(),
            seq,
            kind: "transcript".into(),
            payload: serde_json::json!({"text": "hi"}),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = MemoryStore::new();
        store.upsert_call(&record("c1")).await.unwrap();

        let mut updated = record("c1");
        updated.status = CallStatus::Completed;
        store.upsert_call(&updated).await.unwrap();

        assert_eq!(store.call_count(), 1);
        assert_eq!(store.call("c1").unwrap().status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_stores_once() {
        let store = MemoryStore::new();
        store.append_event(&event("c1", 7)).await.unwrap();
        store.append_event(&event("c1", 7)).await.unwrap();
        assert_eq!(store.events("c1").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_expire() {
        let store = MemoryStore::new();
        store.fail_next(1);
        assert!(store.append_event(&event("c1", 1)).await.is_err());
        assert!(store.append_event(&event("c1", 1)).await.is_ok());
    }
}
