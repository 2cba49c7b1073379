//! In-process storage backend.
//!
//! Implements the full [`StoragePort`] contract over mutex-guarded vectors.
//! Used for `memory:` database URLs and as a deterministic backend in tests.

use std::sync::{Mutex, MutexGuard};

use chrono::Duration;
use uuid::Uuid;

use crate::storage::StorageError;
use crate::storage::port::StoragePort;
use crate::storage::types::{
    AlertRule, DetectedFailure, Event, EventCursor, EventFilter, EventPage, Incident,
    IncidentFilter, Rule, SortOrder,
};

#[derive(Default)]
struct Tables {
    events: Vec<Event>,
    incidents: Vec<Incident>,
    rules: Vec<Rule>,
    alert_rules: Vec<AlertRule>,
}

/// Storage backend that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Internal("memory store lock poisoned".to_string()))
    }

    /// Number of stored events across all tenants.
    pub fn event_count(&self) -> usize {
        self.tables().map(|t| t.events.len()).unwrap_or(0)
    }
}

fn page<T: Clone>(items: Vec<&T>, limit: u32, offset: u32) -> Vec<T> {
    items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect()
}

#[async_trait::async_trait]
impl StoragePort for MemoryStore {
    async fn write_event_batch(&self, events: &[Event]) -> Result<(), StorageError> {
        self.tables()?.events.extend_from_slice(events);
        Ok(())
    }

    async fn upsert_incident_by_fingerprint(
        &self,
        failure: &DetectedFailure,
        window: Duration,
    ) -> Result<(Incident, bool), StorageError> {
        let fingerprint = failure.fingerprint();
        let cutoff = failure.window_start(window);
        let mut tables = self.tables()?;

        let open = tables
            .incidents
            .iter_mut()
            .filter(|i| {
                i.tenant_id == failure.tenant_id
                    && i.fingerprint == fingerprint
                    && i.timestamp >= cutoff
            })
            .max_by_key(|i| i.timestamp);

        if let Some(incident) = open {
            incident.occurrence_count += 1;
            incident.timestamp = incident.timestamp.max(failure.timestamp);
            return Ok((incident.clone(), false));
        }

        let incident = Incident::open(failure);
        tables.incidents.push(incident.clone());
        Ok((incident, true))
    }

    async fn read_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Event>, StorageError> {
        let tables = self.tables()?;
        let mut matching: Vec<&Event> = tables
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && filter.matches(e))
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        matching.sort_by_key(|e| e.timestamp);
        if filter.order == SortOrder::Desc {
            matching.reverse();
        }
        Ok(page(matching, limit, offset))
    }

    async fn scan_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        after: Option<EventCursor>,
    ) -> Result<EventPage, StorageError> {
        let tables = self.tables()?;
        // Events are append-only, so the position doubles as the sequence.
        let mut matching: Vec<(EventCursor, &Event)> = tables
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.tenant_id == tenant_id && filter.matches(e))
            .map(|(i, e)| {
                let cursor = EventCursor {
                    timestamp: e.timestamp,
                    seq: i as i64 + 1,
                };
                (cursor, e)
            })
            .filter(|(cursor, _)| after.is_none_or(|after| *cursor > after))
            .collect();
        matching.sort_by_key(|(cursor, _)| *cursor);
        matching.truncate(limit as usize);

        let next = if matching.len() == limit as usize {
            matching.last().map(|(cursor, _)| *cursor)
        } else {
            None
        };
        Ok(EventPage {
            events: matching.into_iter().map(|(_, e)| e.clone()).collect(),
            next,
        })
    }

    async fn read_incidents(
        &self,
        tenant_id: &str,
        filter: &IncidentFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Incident>, StorageError> {
        let tables = self.tables()?;
        let mut matching: Vec<&Incident> = tables
            .incidents
            .iter()
            .filter(|i| i.tenant_id == tenant_id && filter.matches(i))
            .collect();
        matching.sort_by_key(|i| i.timestamp);
        if filter.order == SortOrder::Desc {
            matching.reverse();
        }
        Ok(page(matching, limit, offset))
    }

    async fn read_rules(&self, tenant_id: &str) -> Result<Vec<Rule>, StorageError> {
        let tables = self.tables()?;
        let mut rules: Vec<Rule> = tables
            .rules
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rules)
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        self.tables()?.rules.push(rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<bool, StorageError> {
        let mut tables = self.tables()?;
        let before = tables.rules.len();
        tables
            .rules
            .retain(|r| !(r.tenant_id == tenant_id && r.id == rule_id));
        Ok(tables.rules.len() != before)
    }

    async fn read_alert_rules(&self, tenant_id: &str) -> Result<Vec<AlertRule>, StorageError> {
        Ok(self
            .tables()?
            .alert_rules
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn insert_alert_rule(&self, rule: &AlertRule) -> Result<(), StorageError> {
        self.tables()?.alert_rules.push(rule.clone());
        Ok(())
    }

    async fn delete_alert_rule(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables()?;
        let before = tables.alert_rules.len();
        tables
            .alert_rules
            .retain(|r| !(r.tenant_id == tenant_id && r.id == rule_id));
        Ok(tables.alert_rules.len() != before)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.tables().map(|_| ())
    }
}
