//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::{Value, json};
use temporallayr::storage::{
    AlertRule, DetectedFailure, Event, EventCursor, EventFilter, EventPage, Incident,
    IncidentFilter, Rule,
};
use temporallayr::{
    AlertConfig, AlertDispatcher, BackoffPolicy, EventStream, FailureDetector, FanoutBroadcaster,
    FanoutConfig, MemoryStore, PipelineDeps, RuleEngine, RuleStore, StorageError, StoragePort,
};
use uuid::Uuid;

// =============================================================================
// Faulty storage
// =============================================================================

/// [`MemoryStore`] wrapper with switchable failures and delays.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    read_delay: Mutex<Duration>,
    rule_read_delay: Mutex<Duration>,
    rule_reads: AtomicUsize,
    write_attempts: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn delay_reads(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    /// Delay rule reads *after* the snapshot is taken, so writes landing
    /// during the delay are missing from the result.
    pub fn delay_rule_reads(&self, delay: Duration) {
        *self.rule_read_delay.lock().unwrap() = delay;
    }

    pub fn rule_reads(&self) -> usize {
        self.rule_reads.load(Ordering::SeqCst)
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    async fn before_read(&self) -> Result<(), StorageError> {
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoragePort for FaultyStore {
    async fn write_event_batch(&self, events: &[Event]) -> Result<(), StorageError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        self.inner.write_event_batch(events).await
    }

    async fn upsert_incident_by_fingerprint(
        &self,
        failure: &DetectedFailure,
        window: ChronoDuration,
    ) -> Result<(Incident, bool), StorageError> {
        self.inner.upsert_incident_by_fingerprint(failure, window).await
    }

    async fn read_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Event>, StorageError> {
        self.before_read().await?;
        self.inner.read_events(tenant_id, filter, limit, offset).await
    }

    async fn scan_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        after: Option<EventCursor>,
    ) -> Result<EventPage, StorageError> {
        self.before_read().await?;
        self.inner.scan_events(tenant_id, filter, limit, after).await
    }

    async fn read_incidents(
        &self,
        tenant_id: &str,
        filter: &IncidentFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Incident>, StorageError> {
        self.before_read().await?;
        self.inner.read_incidents(tenant_id, filter, limit, offset).await
    }

    async fn read_rules(&self, tenant_id: &str) -> Result<Vec<Rule>, StorageError> {
        self.rule_reads.fetch_add(1, Ordering::SeqCst);
        let rules = self.inner.read_rules(tenant_id).await;
        let delay = *self.rule_read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        rules
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        self.inner.insert_rule(rule).await
    }

    async fn delete_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<bool, StorageError> {
        self.inner.delete_rule(tenant_id, rule_id).await
    }

    async fn read_alert_rules(&self, tenant_id: &str) -> Result<Vec<AlertRule>, StorageError> {
        self.inner.read_alert_rules(tenant_id).await
    }

    async fn insert_alert_rule(&self, rule: &AlertRule) -> Result<(), StorageError> {
        self.inner.insert_alert_rule(rule).await
    }

    async fn delete_alert_rule(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> Result<bool, StorageError> {
        self.inner.delete_alert_rule(tenant_id, rule_id).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// Pipeline collaborators over `storage` with fast alert retries.
pub fn pipeline_deps(storage: Arc<dyn StoragePort>) -> PipelineDeps {
    let alerts = AlertDispatcher::new(
        storage.clone(),
        AlertConfig {
            retry: BackoffPolicy::new(2, Duration::from_millis(10), 1.0),
            ..Default::default()
        },
    )
    .expect("alert dispatcher");

    PipelineDeps {
        storage: storage.clone(),
        rules: RuleEngine::new(RuleStore::new(storage)),
        detector: FailureDetector::new(),
        alerts,
        fanout: FanoutBroadcaster::new(FanoutConfig::default()),
        stream: EventStream::default(),
    }
}

/// Event body whose `fetch` node reports an exception.
pub fn failing_event(execution_id: &str) -> Value {
    json!({
        "execution_id": execution_id,
        "status": "FAILED",
        "nodes": [
            {"id": "1", "name": "load", "metadata": {"rows": 12}},
            {"id": "2", "parent_id": "1", "name": "fetch", "metadata": {"exception": "Timeout"}}
        ]
    })
}

/// Event body with nothing wrong in it.
pub fn healthy_event(execution_id: &str) -> Value {
    json!({
        "execution_id": execution_id,
        "status": "OK",
        "duration": 120,
        "nodes": [{"id": "1", "name": "load", "metadata": {"rows": 12}}]
    })
}

/// Yield until `cond` holds, advancing the (possibly paused) clock in small
/// steps. Panics after `max` of virtual time.
pub async fn wait_for(max: Duration, mut cond: impl FnMut() -> bool) {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while !cond() {
        assert!(waited < max, "condition not met within {max:?}");
        tokio::time::sleep(step).await;
        waited += step;
    }
}
