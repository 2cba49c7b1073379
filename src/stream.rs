//! In-process event stream.
//!
//! A thin wrapper over `tokio::sync::broadcast` carrying lightweight
//! "execution ingested" notices. Readers that fall behind skip ahead;
//! publishing with nobody listening is fine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer size for the broadcast channel.
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

/// Notice kind carried on the stream.
pub const EXECUTION_INGESTED: &str = "execution_ingested";

/// Notification that an event passed through ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestNotice {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
}

impl IngestNotice {
    pub fn ingested(
        tenant_id: impl Into<String>,
        execution_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EXECUTION_INGESTED.to_string(),
            execution_id,
            tenant_id: tenant_id.into(),
            timestamp,
        }
    }
}

/// Broadcast stream of [`IngestNotice`]s.
#[derive(Clone)]
pub struct EventStream {
    tx: broadcast::Sender<IngestNotice>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

impl EventStream {
    /// Create a stream with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a notice. Never fails; returns how many readers got it.
    pub fn publish(&self, notice: IngestNotice) -> usize {
        self.tx.send(notice).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestNotice> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
