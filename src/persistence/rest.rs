//! REST-backed call store.
//!
//! Speaks a minimal write-only surface against the configured store URL:
//! `PUT {base}/calls/{id}` upserts the consolidated record and
//! `POST {base}/calls/{id}/events` appends one event, carrying the
//! idempotency key in the `Idempotency-Key` header so retried appends
//! deduplicate server-side.

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{CallRecord, CallStore, StoreError, StoreResult, StoredEvent};

/// HTTP client for the persistence service.
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn check(status: StatusCode) -> StoreResult<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl CallStore for RestStore {
    async fn upsert_call(&self, record: &CallRecord) -> StoreResult<()> {
        let url = format!("{}/calls/{}", self.base_url, record.id);
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(record)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Self::check(response.status())
    }

    async fn append_event(&self, event: &StoredEvent) -> StoreResult<()> {
        let url = format!("{}/calls/{}/events", self.base_url, event.call_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(
                "Idempotency-Key",
                format!("{}:{}", event.call_id, event.seq),
            )
            .json(event)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Self::check(response.status())
    }
}
