//! Core data types for the storage layer.
//!
//! This module defines the records that flow through the Storage Port:
//!
//! - [`Event`]: typed envelope around an arbitrary execution-trace payload
//! - [`Incident`]: deduplicated failure record keyed by fingerprint
//! - [`Rule`]: tenant-configured anomaly rule
//! - [`AlertRule`]: webhook routing rule for new incidents
//! - [`EventFilter`] / [`IncidentFilter`]: read-side predicates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::graph::{self, Node};

// =============================================================================
// Sorting
// =============================================================================

/// Sort order for queries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// An ingested execution-trace event.
///
/// Known fields are lifted out of the producer payload once, at ingestion,
/// so the rest of the system reads them typed. The full payload is kept
/// verbatim for detection, search and broadcast. Malformed known fields are
/// treated as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Owning tenant.
    pub tenant_id: String,
    /// Producer-supplied event id (`id` or `event_id`).
    pub event_id: Option<String>,
    /// Execution this event belongs to (`execution_id`, else `id`).
    pub execution_id: Option<String>,
    /// Execution status, e.g. `"FAILED"`.
    pub status: Option<String>,
    /// Execution duration as reported by the producer.
    pub duration: Option<f64>,
    /// Cluster the execution was grouped into.
    pub cluster_id: Option<String>,
    /// Producer timestamp, falling back to `ingested_at`.
    pub timestamp: DateTime<Utc>,
    /// Server-assigned ingestion time.
    pub ingested_at: DateTime<Utc>,
    /// Original payload.
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an envelope from a raw producer body.
    ///
    /// Non-object bodies are wrapped as `{"value": body}`.
    pub fn new(tenant_id: impl Into<String>, body: Value, ingested_at: DateTime<Utc>) -> Self {
        let payload = match body {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let event_id = first_scalar(&payload, &["id", "event_id"]);
        let execution_id = first_scalar(&payload, &["execution_id", "id"]);
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        let duration = payload
            .get("duration")
            .and_then(Value::as_f64)
            .or_else(|| payload.get("duration_ms").and_then(Value::as_f64))
            .or_else(|| lookup(&payload, "metrics.duration_ms").and_then(Value::as_f64));
        let cluster_id = first_scalar(&payload, &["cluster_id"]);
        let timestamp = ["timestamp", "created_at"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(parse_timestamp))
            .unwrap_or(ingested_at);

        Self {
            tenant_id: tenant_id.into(),
            event_id,
            execution_id,
            status,
            duration,
            cluster_id,
            timestamp,
            ingested_at,
            payload,
        }
    }

    /// Look up a payload field by dotted path (`metrics.duration_ms`).
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.payload, path)
    }

    /// Top-level `metadata` object, if present.
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.payload.get("metadata").and_then(Value::as_object)
    }

    /// Nodes of the execution graph in traversal order.
    pub fn nodes(&self) -> Vec<&Node> {
        graph::walk(&self.payload)
    }

    /// Whether the execution reported a failed status.
    pub fn is_failed(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("failed"))
    }
}

/// Resolve a dotted path against a JSON object.
pub fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = root.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn first_scalar(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse an RFC 3339 string or an epoch number (seconds, or milliseconds
/// when the magnitude says so).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => {
            let raw = n.as_f64()?;
            if !raw.is_finite() {
                return None;
            }
            if raw.abs() >= 1e12 {
                DateTime::from_timestamp_millis(raw as i64)
            } else {
                let secs = raw.floor();
                let nanos = ((raw - secs) * 1e9) as u32;
                DateTime::from_timestamp(secs as i64, nanos)
            }
        }
        _ => None,
    }
}

// =============================================================================
// Incident
// =============================================================================

/// A failure detected in a single event, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFailure {
    pub tenant_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub failure_type: String,
    pub node_name: String,
    pub summary: String,
}

impl DetectedFailure {
    /// Grouping key for deduplication.
    pub fn fingerprint(&self) -> String {
        crate::detector::fingerprint(&self.failure_type, &self.node_name)
    }

    /// Oldest incident timestamp still inside the dedup window.
    ///
    /// Saturates at the earliest representable time.
    pub fn window_start(&self, window: chrono::Duration) -> DateTime<Utc> {
        self.timestamp
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A deduplicated failure record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub tenant_id: String,
    pub execution_id: String,
    /// Time of the most recent occurrence.
    pub timestamp: DateTime<Utc>,
    pub failure_type: String,
    pub node_name: String,
    pub summary: String,
    pub fingerprint: String,
    pub occurrence_count: i64,
}

impl Incident {
    /// First occurrence of a detected failure.
    pub fn open(failure: &DetectedFailure) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: failure.tenant_id.clone(),
            execution_id: failure.execution_id.clone(),
            timestamp: failure.timestamp,
            failure_type: failure.failure_type.clone(),
            node_name: failure.node_name.clone(),
            summary: failure.summary.clone(),
            fingerprint: failure.fingerprint(),
            occurrence_count: 1,
        }
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Incident severity assigned by a rule.
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
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Rule condition types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConditionType {
    /// Event duration exceeds a threshold.
    ExecutionLatency,
    /// Metadata carries `diverged: true`.
    DivergenceDetected,
    /// Single-event proxy for an error-rate rule.
    NodeErrorRate,
    /// Cluster size exceeds a threshold.
    ClusterAnomaly,
    /// Numeric comparison of an arbitrary field.
    CustomExpression,
}

/// Condition half of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Action half of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleActions {
    pub create_incident: bool,
    pub severity: Severity,
    pub notify: bool,
}

impl Default for RuleActions {
    fn default() -> Self {
        Self {
            create_incident: true,
            severity: Severity::Medium,
            notify: false,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Tenant-scoped anomaly rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub condition: RuleCondition,
    #[serde(default)]
    pub actions: RuleActions,
    pub created_at: DateTime<Utc>,
}

/// Rule as submitted by a client; ids and timestamps are server-assigned.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub condition: RuleCondition,
    #[serde(default)]
    pub actions: RuleActions,
}

impl NewRule {
    pub fn into_rule(self, tenant_id: impl Into<String>) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: self.name,
            enabled: self.enabled,
            priority: self.priority,
            condition: self.condition,
            actions: self.actions,
            created_at: Utc::now(),
        }
    }
}

/// Webhook routing rule for newly created incidents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub failure_type: String,
    pub node_name: Option<String>,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    /// `failure_type` must match; an unset `node_name` matches any node.
    pub fn matches(&self, incident: &Incident) -> bool {
        self.failure_type == incident.failure_type
            && self
                .node_name
                .as_deref()
                .is_none_or(|node| node == incident.node_name)
    }

    /// Webhook target, if one is configured.
    pub fn webhook(&self) -> Option<&str> {
        self.webhook_url.as_deref().filter(|url| !url.is_empty())
    }
}

/// Alert rule as submitted by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAlertRule {
    #[serde(default)]
    pub name: String,
    pub failure_type: String,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl NewAlertRule {
    pub fn into_rule(self, tenant_id: impl Into<String>) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: self.name,
            failure_type: self.failure_type,
            node_name: self.node_name,
            webhook_url: self.webhook_url,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Position in an ascending `(timestamp, insertion order)` event scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventCursor {
    pub timestamp: DateTime<Utc>,
    pub seq: i64,
}

/// One page of a keyset scan.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Start of the next page; `None` once the scan is exhausted.
    pub next: Option<EventCursor>,
}

/// Predicates for reading events. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub execution_id: Option<String>,
    pub status: Option<String>,
    pub node_name: Option<String>,
    pub cluster_id: Option<String>,
    /// Only events that carry any `cluster_id`.
    pub has_cluster: bool,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Case-insensitive substring over the serialized payload.
    pub search_text: Option<String>,
    /// Equality on stringified top-level payload fields.
    pub attributes: Vec<(String, String)>,
    pub order: SortOrder,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if self
            .execution_id
            .as_ref()
            .is_some_and(|id| event.execution_id.as_ref() != Some(id))
        {
            return false;
        }
        if self
            .status
            .as_ref()
            .is_some_and(|s| event.status.as_ref() != Some(s))
        {
            return false;
        }
        if self
            .cluster_id
            .as_ref()
            .is_some_and(|c| event.cluster_id.as_ref() != Some(c))
        {
            return false;
        }
        if self.has_cluster && event.cluster_id.is_none() {
            return false;
        }
        if self.start.is_some_and(|start| event.timestamp < start)
            || self.end.is_some_and(|end| event.timestamp > end)
        {
            return false;
        }
        if let Some(name) = &self.node_name
            && !event
                .nodes()
                .iter()
                .any(|node| graph::node_name(node) == Some(name.as_str()))
        {
            return false;
        }
        if let Some(text) = &self.search_text {
            let haystack = serde_json::to_string(&event.payload)
                .unwrap_or_default()
                .to_lowercase();
            if !haystack.contains(&text.to_lowercase()) {
                return false;
            }
        }
        self.attributes.iter().all(|(key, expected)| {
            event
                .payload
                .get(key)
                .is_some_and(|value| stringify(value) == *expected)
        })
    }
}

/// Predicates for reading incidents. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub incident_id: Option<Uuid>,
    pub execution_id: Option<String>,
    pub node_name: Option<String>,
    pub fingerprint: Option<String>,
    pub failure_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Case-insensitive substring over the summary.
    pub search_text: Option<String>,
    pub order: SortOrder,
}

impl IncidentFilter {
    pub fn matches(&self, incident: &Incident) -> bool {
        self.incident_id.is_none_or(|id| incident.id == id)
            && self
                .execution_id
                .as_ref()
                .is_none_or(|id| &incident.execution_id == id)
            && self
                .node_name
                .as_ref()
                .is_none_or(|n| &incident.node_name == n)
            && self
                .fingerprint
                .as_ref()
                .is_none_or(|f| &incident.fingerprint == f)
            && self
                .failure_type
                .as_ref()
                .is_none_or(|t| &incident.failure_type == t)
            && self.start.is_none_or(|start| incident.timestamp >= start)
            && self.end.is_none_or(|end| incident.timestamp <= end)
            && self.search_text.as_ref().is_none_or(|text| {
                incident
                    .summary
                    .to_lowercase()
                    .contains(&text.to_lowercase())
            })
    }
}

/// String form used for attribute equality.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
