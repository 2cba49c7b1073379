//! Query request/response types and settings.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::query::condition::{Condition, parse_query};
use crate::storage::{EventFilter, IncidentFilter, SortOrder, stringify};

/// The only sortable field.
pub const SORT_FIELD_TIMESTAMP: &str = "timestamp";

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_limit() -> u32 {
    5000
}

fn default_limit() -> u32 {
    100
}

fn default_slow_query_threshold() -> Duration {
    Duration::from_secs(1)
}

fn default_page_size() -> u32 {
    5000
}

/// Read-side settings shared by search and aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Hard timeout per storage read.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Hard cap on returned records.
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_slow_query_threshold", with = "humantime_serde")]
    pub slow_query_threshold: Duration,
    /// Events fetched per page during aggregation.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_limit: default_max_limit(),
            default_limit: default_limit(),
            slow_query_threshold: default_slow_query_threshold(),
            page_size: default_page_size(),
        }
    }
}

/// Request validation errors. Timeouts and storage failures are not errors;
/// they produce partial results.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("limit exceeds maximum ({max})")]
    LimitExceeded { limit: u32, max: u32 },

    #[error("limit must be at least 1")]
    InvalidLimit,

    #[error("invalid sort field '{0}'")]
    InvalidSortField(String),

    #[error("interval_seconds must be positive")]
    InvalidInterval,

    #[error("start must not be after end")]
    InvalidTimeRange,

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Searchable resources.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Events,
    Incidents,
    /// Nodes of matching events, flattened.
    Nodes,
    /// Events grouped into a cluster.
    Clusters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// Structured filters. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    pub execution_id: Option<String>,
    pub node_name: Option<String>,
    pub fingerprint: Option<String>,
    pub status: Option<String>,
    pub incident_id: Option<Uuid>,
    pub cluster_id: Option<String>,
    pub failure_type: Option<String>,
    pub time_range: Option<TimeRange>,
    /// Equality on top-level payload fields.
    pub attributes: BTreeMap<String, Value>,
}

impl QueryFilters {
    fn bounds(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        self.time_range
            .as_ref()
            .map_or((None, None), |r| (r.start, r.end))
    }

    pub fn event_filter(&self, search_text: Option<&str>, order: SortOrder) -> EventFilter {
        let (start, end) = self.bounds();
        EventFilter {
            execution_id: self.execution_id.clone(),
            status: self.status.clone(),
            node_name: self.node_name.clone(),
            cluster_id: self.cluster_id.clone(),
            has_cluster: false,
            start,
            end,
            search_text: search_text.map(str::to_string),
            attributes: self
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), stringify(v)))
                .collect(),
            order,
        }
    }

    pub fn incident_filter(&self, search_text: Option<&str>, order: SortOrder) -> IncidentFilter {
        let (start, end) = self.bounds();
        IncidentFilter {
            incident_id: self.incident_id,
            execution_id: self.execution_id.clone(),
            node_name: self.node_name.clone(),
            fingerprint: self.fingerprint.clone(),
            failure_type: self.failure_type.clone(),
            start,
            end,
            search_text: search_text.map(str::to_string),
            order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    #[serde(default = "default_sort_field")]
    pub field: String,
    #[serde(default)]
    pub direction: SortOrder,
}

fn default_sort_field() -> String {
    SORT_FIELD_TIMESTAMP.to_string()
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: default_sort_field(),
            direction: SortOrder::Desc,
        }
    }
}

/// One search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub tenant_id: String,
    pub resource: ResourceKind,
    pub filters: QueryFilters,
    pub search_text: Option<String>,
    /// Conditions such as `status == FAILED AND retries > 2`.
    pub query: Option<String>,
    pub sort: SortSpec,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl QueryRequest {
    pub fn new(tenant_id: impl Into<String>, resource: ResourceKind) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resource,
            ..Default::default()
        }
    }

    /// Check the request and resolve the effective limit.
    pub fn validate(&self, config: &QueryConfig) -> Result<u32, QueryError> {
        let limit = self.limit.unwrap_or(config.default_limit);
        if limit > config.max_limit {
            return Err(QueryError::LimitExceeded {
                limit,
                max: config.max_limit,
            });
        }
        if self.sort.field != SORT_FIELD_TIMESTAMP {
            return Err(QueryError::InvalidSortField(self.sort.field.clone()));
        }
        Ok(limit)
    }

    pub fn search_text(&self) -> Option<&str> {
        self.search_text.as_deref().filter(|s| !s.is_empty())
    }

    pub fn conditions(&self) -> Result<Vec<Condition>, QueryError> {
        self.query.as_deref().map_or(Ok(Vec::new()), parse_query)
    }
}

/// Search response. `partial` means the fetch did not complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Vec<Value>,
    pub total: usize,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl QueryResult {
    pub fn complete(data: Vec<Value>) -> Self {
        Self {
            total: data.len(),
            data,
            partial: false,
            warning: None,
        }
    }

    pub fn partial(warning: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            total: 0,
            partial: true,
            warning: Some(warning.into()),
        }
    }
}
