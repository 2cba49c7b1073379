//! Execution traces: a newest-first listing and lookup by execution id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::query::engine::{FAILED_WARNING, QueryEngine, timeout_warning};
use crate::query::types::QueryError;
use crate::storage::{Event, EventFilter, SortOrder, StorageError};

pub const MAX_TRACE_LIMIT: u32 = 100;
pub const DEFAULT_TRACE_LIMIT: u32 = 50;

/// Reported when an event carries no status.
pub const UNKNOWN_STATUS: &str = "UNKNOWN";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceListRequest {
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
    /// Exact status match, e.g. `FAILED`.
    pub status: Option<String>,
}

impl TraceListRequest {
    pub fn validate(&self) -> Result<u32, QueryError> {
        match self.limit.unwrap_or(DEFAULT_TRACE_LIMIT) {
            0 => Err(QueryError::InvalidLimit),
            limit if limit > MAX_TRACE_LIMIT => Err(QueryError::LimitExceeded {
                limit,
                max: MAX_TRACE_LIMIT,
            }),
            limit => Ok(limit),
        }
    }
}

/// One row of the trace listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Whether the execution failed.
    pub error: bool,
    pub status: String,
}

impl From<&Event> for TraceSummary {
    fn from(event: &Event) -> Self {
        Self {
            id: event.execution_id.clone(),
            timestamp: event.timestamp,
            error: event.is_failed(),
            status: event
                .status
                .clone()
                .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceList {
    pub items: Vec<TraceSummary>,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// A full trace with its original payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceDetail {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub payload: Map<String, Value>,
}

impl QueryEngine {
    /// List a tenant's traces, newest first.
    ///
    /// Like [`QueryEngine::search`], a failed or timed-out read yields an
    /// empty listing flagged `partial`.
    pub async fn list_traces(
        &self,
        tenant_id: &str,
        request: &TraceListRequest,
    ) -> Result<TraceList, QueryError> {
        let limit = request.validate()?;
        let filter = EventFilter {
            status: request.status.clone(),
            order: SortOrder::Desc,
            ..Default::default()
        };

        let read = self
            .storage
            .read_events(tenant_id, &filter, limit, request.offset);
        let list = match timeout(self.config.timeout, read).await {
            Ok(Ok(events)) => TraceList {
                items: events.iter().map(TraceSummary::from).collect(),
                ..Default::default()
            },
            Ok(Err(e)) => {
                tracing::error!(tenant_id = %tenant_id, error = %e, "Trace listing failed");
                TraceList {
                    partial: true,
                    warning: Some(FAILED_WARNING.to_string()),
                    ..Default::default()
                }
            }
            Err(_) => {
                tracing::warn!(tenant_id = %tenant_id, "Trace listing timed out");
                TraceList {
                    partial: true,
                    warning: Some(timeout_warning(&self.config)),
                    ..Default::default()
                }
            }
        };

        tracing::debug!(
            tenant_id = %tenant_id,
            limit,
            offset = request.offset,
            rows = list.items.len(),
            "Traces listed"
        );
        Ok(list)
    }

    /// The most recent event of one execution, or `None` if the tenant has
    /// no such execution.
    pub async fn get_trace(
        &self,
        tenant_id: &str,
        trace_id: &str,
    ) -> Result<Option<TraceDetail>, StorageError> {
        let filter = EventFilter {
            execution_id: Some(trace_id.to_string()),
            order: SortOrder::Desc,
            ..Default::default()
        };

        let read = self.storage.read_events(tenant_id, &filter, 1, 0);
        let events = timeout(self.config.timeout, read)
            .await
            .map_err(|_| StorageError::Unavailable(timeout_warning(&self.config)))??;

        tracing::debug!(
            tenant_id = %tenant_id,
            trace_id = %trace_id,
            found = !events.is_empty(),
            "Trace fetched"
        );
        Ok(events.into_iter().next().map(|event| TraceDetail {
            id: trace_id.to_string(),
            timestamp: event.timestamp,
            tenant_id: event.tenant_id,
            payload: event.payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::query::QueryConfig;
    use crate::storage::{MemoryStore, StoragePort};

    async fn engine() -> QueryEngine {
        let storage = Arc::new(MemoryStore::new());
        let events: Vec<Event> = [
            ("a", Some("OK"), 1),
            ("b", Some("FAILED"), 2),
            ("c", None, 3),
            ("d", Some("FAILED"), 4),
        ]
        .into_iter()
        .map(|(id, status, sec)| {
            let mut body = json!({
                "execution_id": id,
                "timestamp": format!("2024-03-01T12:00:0{sec}Z"),
            });
            if let Some(status) = status {
                body["status"] = json!(status);
            }
            Event::new("t1", body, Utc::now())
        })
        .collect();
        storage.write_event_batch(&events).await.unwrap();
        QueryEngine::new(storage, QueryConfig::default())
    }

    #[tokio::test]
    async fn test_list_traces_newest_first_with_error_flag() {
        let list = engine()
            .await
            .list_traces("t1", &TraceListRequest::default())
            .await
            .unwrap();
        assert!(!list.partial);

        let ids: Vec<_> = list.items.iter().filter_map(|t| t.id.as_deref()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
        assert!(list.items[0].error);
        assert_eq!(list.items[1].status, UNKNOWN_STATUS);
        assert!(!list.items[1].error);
        assert!(!list.items[3].error);
    }

    #[tokio::test]
    async fn test_list_traces_status_filter_and_paging() {
        let engine = engine().await;
        let request = TraceListRequest {
            status: Some("FAILED".into()),
            ..Default::default()
        };
        let list = engine.list_traces("t1", &request).await.unwrap();
        assert_eq!(list.items.len(), 2);
        assert!(list.items.iter().all(|t| t.error));

        let request = TraceListRequest {
            limit: Some(1),
            offset: 1,
            status: None,
        };
        let list = engine.list_traces("t1", &request).await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].id.as_deref(), Some("c"));

        let other = engine
            .list_traces("t2", &TraceListRequest::default())
            .await
            .unwrap();
        assert!(other.items.is_empty());
    }

    #[test]
    fn test_list_limit_bounds() {
        let mut request = TraceListRequest::default();
        assert_eq!(request.validate(), Ok(DEFAULT_TRACE_LIMIT));
        request.limit = Some(100);
        assert_eq!(request.validate(), Ok(100));
        request.limit = Some(101);
        assert_eq!(
            request.validate(),
            Err(QueryError::LimitExceeded { limit: 101, max: 100 })
        );
        request.limit = Some(0);
        assert_eq!(request.validate(), Err(QueryError::InvalidLimit));
    }

    #[tokio::test]
    async fn test_get_trace() {
        let engine = engine().await;
        let trace = engine.get_trace("t1", "b").await.unwrap().unwrap();
        assert_eq!(trace.id, "b");
        assert_eq!(trace.tenant_id, "t1");
        assert_eq!(trace.payload["status"], "FAILED");

        assert!(engine.get_trace("t1", "missing").await.unwrap().is_none());
        assert!(engine.get_trace("t2", "b").await.unwrap().is_none());
    }
}
