//! The Storage Port: the durable read/write contract the engine depends on.

use chrono::Duration;
use uuid::Uuid;

use crate::storage::StorageError;
use crate::storage::types::{
    AlertRule, DetectedFailure, Event, EventCursor, EventFilter, EventPage, Incident,
    IncidentFilter, Rule,
};

/// Durable storage for events, incidents and rules.
///
/// Every method must be safe to cancel: callers wrap each call in a
/// timeout and drop the future when it elapses.
#[async_trait::async_trait]
pub trait StoragePort: Send + Sync + 'static {
    /// Persist a batch of events atomically.
    async fn write_event_batch(&self, events: &[Event]) -> Result<(), StorageError>;

    /// Record one occurrence of a detected failure.
    ///
    /// If an incident with the same tenant and fingerprint was last seen
    /// within `window` of `failure.timestamp`, its `occurrence_count` is
    /// incremented and its timestamp advanced; otherwise a new incident is
    /// inserted. Returns the resulting incident and whether it was inserted.
    async fn upsert_incident_by_fingerprint(
        &self,
        failure: &DetectedFailure,
        window: Duration,
    ) -> Result<(Incident, bool), StorageError>;

    /// Read events of one tenant, sorted by timestamp.
    async fn read_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Event>, StorageError>;

    /// Scan events of one tenant in ascending `(timestamp, insertion)`
    /// order, strictly after `after`. `filter.order` is ignored.
    ///
    /// Events written while a scan is in progress never shift pages that
    /// follow the cursor.
    async fn scan_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        after: Option<EventCursor>,
    ) -> Result<EventPage, StorageError>;

    /// Read incidents of one tenant, sorted by timestamp.
    async fn read_incidents(
        &self,
        tenant_id: &str,
        filter: &IncidentFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Incident>, StorageError>;

    /// All rules of a tenant, highest priority first.
    async fn read_rules(&self, tenant_id: &str) -> Result<Vec<Rule>, StorageError>;

    async fn insert_rule(&self, rule: &Rule) -> Result<(), StorageError>;

    /// Returns `false` if no such rule existed.
    async fn delete_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<bool, StorageError>;

    async fn read_alert_rules(&self, tenant_id: &str) -> Result<Vec<AlertRule>, StorageError>;

    async fn insert_alert_rule(&self, rule: &AlertRule) -> Result<(), StorageError>;

    async fn delete_alert_rule(&self, tenant_id: &str, rule_id: Uuid)
    -> Result<bool, StorageError>;

    /// Cheap liveness check used by readiness probes.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Release backend resources. Further calls may fail.
    async fn close(&self) {}
}
