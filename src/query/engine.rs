//! Timeout-guarded search over stored events and incidents.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::time::timeout;

use crate::graph;
use crate::query::condition::{Condition, matches_all};
use crate::query::types::{QueryConfig, QueryError, QueryRequest, QueryResult, ResourceKind};
use crate::storage::{Event, EventFilter, IncidentFilter, StorageError, StoragePort};

/// Warning attached when a storage read fails.
pub const FAILED_WARNING: &str = "query failed: results may be incomplete";

pub(crate) fn timeout_warning(config: &QueryConfig) -> String {
    format!(
        "query timed out after {}",
        humantime::format_duration(config.timeout)
    )
}

/// Multi-resource search with a hard timeout and result cap.
#[derive(Clone)]
pub struct QueryEngine {
    pub(super) storage: Arc<dyn StoragePort>,
    pub(super) config: QueryConfig,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    pub fn new(storage: Arc<dyn StoragePort>, config: QueryConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Run a search.
    ///
    /// Only request validation fails. A timeout or storage error yields an
    /// empty result flagged `partial`.
    pub async fn search(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        let limit = request.validate(&self.config)?;
        let conditions = request.conditions()?;
        let started = Instant::now();

        let outcome = timeout(
            self.config.timeout,
            self.fetch(request, &conditions, limit),
        )
        .await;
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_query_threshold {
            tracing::warn!(
                tenant_id = %request.tenant_id,
                resource = %request.resource,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow query"
            );
        }

        let result = match outcome {
            Ok(Ok(data)) => QueryResult::complete(data),
            Ok(Err(e)) => {
                tracing::error!(
                    tenant_id = %request.tenant_id,
                    resource = %request.resource,
                    error = %e,
                    "Query failed"
                );
                QueryResult::partial(FAILED_WARNING)
            }
            Err(_) => {
                tracing::warn!(
                    tenant_id = %request.tenant_id,
                    resource = %request.resource,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Query timed out"
                );
                QueryResult::partial(timeout_warning(&self.config))
            }
        };

        tracing::debug!(
            tenant_id = %request.tenant_id,
            resource = %request.resource,
            rows = result.total,
            partial = result.partial,
            "Query executed"
        );
        Ok(result)
    }

    async fn fetch(
        &self,
        request: &QueryRequest,
        conditions: &[Condition],
        limit: u32,
    ) -> Result<Vec<Value>, StorageError> {
        let tenant = request.tenant_id.as_str();
        let order = request.sort.direction;
        let search_text = request.search_text();

        match request.resource {
            ResourceKind::Events => {
                let filter = request.filters.event_filter(search_text, order);
                let events = self
                    .read_events(tenant, &filter, conditions, limit, request.offset)
                    .await?;
                Ok(events
                    .into_iter()
                    .map(|e| Value::Object(e.payload))
                    .collect())
            }
            ResourceKind::Incidents => {
                let filter = request.filters.incident_filter(search_text, order);
                self.read_incidents(tenant, &filter, conditions, limit, request.offset)
                    .await
            }
            ResourceKind::Nodes => {
                let filter = request.filters.event_filter(search_text, order);
                let events = self
                    .read_events(tenant, &filter, conditions, limit, request.offset)
                    .await?;
                let wanted = request.filters.node_name.as_deref();

                let mut nodes = Vec::new();
                'events: for event in &events {
                    for node in event.nodes() {
                        if wanted.is_some_and(|name| graph::node_name(node) != Some(name)) {
                            continue;
                        }
                        let mut node = node.clone();
                        if let Some(execution_id) = &event.execution_id {
                            node.insert(
                                "execution_id".to_string(),
                                Value::String(execution_id.clone()),
                            );
                        }
                        nodes.push(Value::Object(node));
                        if nodes.len() >= limit as usize {
                            break 'events;
                        }
                    }
                }
                Ok(nodes)
            }
            ResourceKind::Clusters => {
                let mut filter = request.filters.event_filter(search_text, order);
                filter.has_cluster = true;
                let events = self
                    .read_events(tenant, &filter, conditions, limit, request.offset)
                    .await?;
                Ok(events
                    .into_iter()
                    .map(|e| Value::Object(e.payload))
                    .collect())
            }
        }
    }

    /// Read events, applying `conditions` in memory.
    ///
    /// With conditions the store is paged in `page_size` reads until
    /// `offset + limit` matching events are seen or it runs dry.
    async fn read_events(
        &self,
        tenant: &str,
        filter: &EventFilter,
        conditions: &[Condition],
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Event>, StorageError> {
        if conditions.is_empty() {
            return self.storage.read_events(tenant, filter, limit, offset).await;
        }

        let page_size = self.config.page_size.max(1);
        let mut skip = offset;
        let mut matched = Vec::new();
        let mut page_offset = 0u32;
        while matched.len() < limit as usize {
            let page = self
                .storage
                .read_events(tenant, filter, page_size, page_offset)
                .await?;
            let exhausted = page.len() < page_size as usize;
            for event in page {
                if !matches_all(conditions, &event.payload) {
                    continue;
                }
                if skip > 0 {
                    skip -= 1;
                } else if matched.len() < limit as usize {
                    matched.push(event);
                }
            }
            if exhausted {
                break;
            }
            page_offset = page_offset.saturating_add(page_size);
        }
        Ok(matched)
    }

    /// Incidents as JSON, filtered the same way as [`Self::read_events`].
    async fn read_incidents(
        &self,
        tenant: &str,
        filter: &IncidentFilter,
        conditions: &[Condition],
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Value>, StorageError> {
        if conditions.is_empty() {
            let incidents = self
                .storage
                .read_incidents(tenant, filter, limit, offset)
                .await?;
            return incidents
                .iter()
                .map(|i| serde_json::to_value(i).map_err(StorageError::from))
                .collect();
        }

        let page_size = self.config.page_size.max(1);
        let mut skip = offset;
        let mut matched = Vec::new();
        let mut page_offset = 0u32;
        while matched.len() < limit as usize {
            let page = self
                .storage
                .read_incidents(tenant, filter, page_size, page_offset)
                .await?;
            let exhausted = page.len() < page_size as usize;
            for incident in &page {
                let value = serde_json::to_value(incident)?;
                if !value.as_object().is_some_and(|r| matches_all(conditions, r)) {
                    continue;
                }
                if skip > 0 {
                    skip -= 1;
                } else if matched.len() < limit as usize {
                    matched.push(value);
                }
            }
            if exhausted {
                break;
            }
            page_offset = page_offset.saturating_add(page_size);
        }
        Ok(matched)
    }
}
