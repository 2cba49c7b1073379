//! SQLite implementation of the Storage Port.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::graph;
use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::port::StoragePort;
use crate::storage::schema::init_schema;
use crate::storage::types::{
    AlertRule, DetectedFailure, Event, EventCursor, EventFilter, EventPage, Incident,
    IncidentFilter, Rule,
};

const INCIDENT_COLUMNS: &str = "id, tenant_id, execution_id, ts, failure_type, node_name, \
     summary, fingerprint, occurrence_count";

const RULE_COLUMNS: &str = "id, tenant_id, name, enabled, priority, condition, actions, created_at";

const ALERT_RULE_COLUMNS: &str =
    "id, tenant_id, name, failure_type, node_name, webhook_url, created_at";

/// Storage Port backed by a SQLite database.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and make sure the schema exists.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = SqlitePool::connect_with(url, max_connections).await?;
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {value}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(value)
        .map_err(|e| StorageError::InvalidData(format!("invalid uuid '{value}': {e}")))
}

fn row_to_event(row: &SqliteRow) -> Result<Event, StorageError> {
    let tenant_id: String = row.try_get("tenant_id")?;
    let ingested_at = from_micros(row.try_get("ingested_at")?)?;
    let payload: String = row.try_get("payload")?;
    let body: Value = serde_json::from_str(&payload)?;
    Ok(Event::new(tenant_id, body, ingested_at))
}

fn row_to_incident(row: &SqliteRow) -> Result<Incident, StorageError> {
    Ok(Incident {
        id: parse_uuid(row.try_get("id")?)?,
        tenant_id: row.try_get("tenant_id")?,
        execution_id: row.try_get("execution_id")?,
        timestamp: from_micros(row.try_get("ts")?)?,
        failure_type: row.try_get("failure_type")?,
        node_name: row.try_get("node_name")?,
        summary: row.try_get("summary")?,
        fingerprint: row.try_get("fingerprint")?,
        occurrence_count: row.try_get("occurrence_count")?,
    })
}

fn row_to_rule(row: &SqliteRow) -> Result<Rule, StorageError> {
    let condition: String = row.try_get("condition")?;
    let actions: String = row.try_get("actions")?;
    Ok(Rule {
        id: parse_uuid(row.try_get("id")?)?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        priority: row.try_get("priority")?,
        condition: serde_json::from_str(&condition)?,
        actions: serde_json::from_str(&actions)?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

fn row_to_alert_rule(row: &SqliteRow) -> Result<AlertRule, StorageError> {
    Ok(AlertRule {
        id: parse_uuid(row.try_get("id")?)?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        failure_type: row.try_get("failure_type")?,
        node_name: row.try_get("node_name")?,
        webhook_url: row.try_get("webhook_url")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

// =============================================================================
// Filter translation
// =============================================================================

/// JSON path for a top-level payload key.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', ""))
}

fn push_event_filters(qb: &mut QueryBuilder<'_, Sqlite>, tenant_id: &str, filter: &EventFilter) {
    qb.push(" WHERE tenant_id = ").push_bind(tenant_id.to_string());
    if let Some(execution_id) = &filter.execution_id {
        qb.push(" AND execution_id = ")
            .push_bind(execution_id.clone());
    }
    if let Some(status) = &filter.status {
        qb.push(" AND status = ").push_bind(status.clone());
    }
    if let Some(cluster_id) = &filter.cluster_id {
        qb.push(" AND cluster_id = ").push_bind(cluster_id.clone());
    }
    if filter.has_cluster {
        qb.push(" AND cluster_id IS NOT NULL");
    }
    if let Some(start) = filter.start {
        qb.push(" AND ts >= ").push_bind(micros(start));
    }
    if let Some(end) = filter.end {
        qb.push(" AND ts <= ").push_bind(micros(end));
    }
    if let Some(name) = &filter.node_name {
        qb.push(" AND EXISTS (SELECT 1 FROM event_nodes n WHERE n.event_seq = events.seq AND n.name = ")
            .push_bind(name.clone())
            .push(")");
    }
    if let Some(text) = &filter.search_text {
        qb.push(" AND instr(lower(payload), ")
            .push_bind(text.to_lowercase())
            .push(") > 0");
    }
    for (key, expected) in &filter.attributes {
        // Booleans compare as `true`/`false`, everything else as its text form.
        let path = json_path(key);
        qb.push(" AND (CASE json_type(payload, ")
            .push_bind(path.clone())
            .push(") WHEN 'true' THEN 'true' WHEN 'false' THEN 'false' ELSE CAST(json_extract(payload, ")
            .push_bind(path)
            .push(") AS TEXT) END) = ")
            .push_bind(expected.clone());
    }
}

fn push_incident_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    tenant_id: &str,
    filter: &IncidentFilter,
) {
    qb.push(" WHERE tenant_id = ").push_bind(tenant_id.to_string());
    if let Some(id) = filter.incident_id {
        qb.push(" AND id = ").push_bind(id.to_string());
    }
    if let Some(execution_id) = &filter.execution_id {
        qb.push(" AND execution_id = ")
            .push_bind(execution_id.clone());
    }
    if let Some(node_name) = &filter.node_name {
        qb.push(" AND node_name = ").push_bind(node_name.clone());
    }
    if let Some(fingerprint) = &filter.fingerprint {
        qb.push(" AND fingerprint = ").push_bind(fingerprint.clone());
    }
    if let Some(failure_type) = &filter.failure_type {
        qb.push(" AND failure_type = ")
            .push_bind(failure_type.clone());
    }
    if let Some(start) = filter.start {
        qb.push(" AND ts >= ").push_bind(micros(start));
    }
    if let Some(end) = filter.end {
        qb.push(" AND ts <= ").push_bind(micros(end));
    }
    if let Some(text) = &filter.search_text {
        qb.push(" AND instr(lower(summary), ")
            .push_bind(text.to_lowercase())
            .push(") > 0");
    }
}

// =============================================================================
// StoragePort
// =============================================================================

#[async_trait::async_trait]
impl StoragePort for SqliteStore {
    async fn write_event_batch(&self, events: &[Event]) -> Result<(), StorageError> {
        let mut tx = self.pool.inner().begin().await?;

        for event in events {
            let payload = serde_json::to_string(&event.payload)?;
            let result = sqlx::query(
                "INSERT INTO events (tenant_id, event_id, execution_id, status, cluster_id, \
                 duration, ts, ingested_at, payload) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.tenant_id)
            .bind(&event.event_id)
            .bind(&event.execution_id)
            .bind(&event.status)
            .bind(&event.cluster_id)
            .bind(event.duration)
            .bind(micros(event.timestamp))
            .bind(micros(event.ingested_at))
            .bind(payload)
            .execute(&mut *tx)
            .await?;

            let seq = result.last_insert_rowid();
            for name in event.nodes().into_iter().filter_map(graph::node_name) {
                sqlx::query("INSERT INTO event_nodes (event_seq, name) VALUES (?, ?)")
                    .bind(seq)
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_incident_by_fingerprint(
        &self,
        failure: &DetectedFailure,
        window: Duration,
    ) -> Result<(Incident, bool), StorageError> {
        let fingerprint = failure.fingerprint();
        let cutoff = micros(failure.window_start(window));
        let mut tx = self.pool.inner().begin().await?;

        let open: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM incidents WHERE tenant_id = ? AND fingerprint = ? AND ts >= ? \
             ORDER BY ts DESC LIMIT 1",
        )
        .bind(&failure.tenant_id)
        .bind(&fingerprint)
        .bind(cutoff)
        .fetch_optional(&mut *tx)
        .await?;

        let (id, is_new) = match open {
            Some((id,)) => {
                sqlx::query(
                    "UPDATE incidents SET occurrence_count = occurrence_count + 1, \
                     ts = MAX(ts, ?) WHERE id = ?",
                )
                .bind(micros(failure.timestamp))
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                (id, false)
            }
            None => {
                let incident = Incident::open(failure);
                let id = incident.id.to_string();
                sqlx::query(&format!(
                    "INSERT INTO incidents ({INCIDENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ))
                .bind(&id)
                .bind(&incident.tenant_id)
                .bind(&incident.execution_id)
                .bind(micros(incident.timestamp))
                .bind(&incident.failure_type)
                .bind(&incident.node_name)
                .bind(&incident.summary)
                .bind(&incident.fingerprint)
                .bind(incident.occurrence_count)
                .execute(&mut *tx)
                .await?;
                (id, true)
            }
        };

        let row = sqlx::query(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?"
        ))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;
        let incident = row_to_incident(&row)?;

        tx.commit().await?;
        Ok((incident, is_new))
    }

    async fn read_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Event>, StorageError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT tenant_id, ingested_at, payload FROM events");
        push_event_filters(&mut qb, tenant_id, filter);
        let order = filter.order.as_sql();
        qb.push(format_args!(" ORDER BY ts {order}, seq {order}"));
        qb.push(" LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn scan_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        limit: u32,
        after: Option<EventCursor>,
    ) -> Result<EventPage, StorageError> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT seq, ts, tenant_id, ingested_at, payload FROM events");
        push_event_filters(&mut qb, tenant_id, filter);
        if let Some(after) = after {
            let ts = micros(after.timestamp);
            qb.push(" AND (ts > ")
                .push_bind(ts)
                .push(" OR (ts = ")
                .push_bind(ts)
                .push(" AND seq > ")
                .push_bind(after.seq)
                .push("))");
        }
        qb.push(" ORDER BY ts ASC, seq ASC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        let mut events = Vec::with_capacity(rows.len());
        let mut last = None;
        for row in &rows {
            last = Some(EventCursor {
                timestamp: from_micros(row.try_get("ts")?)?,
                seq: row.try_get("seq")?,
            });
            events.push(row_to_event(row)?);
        }

        let next = if rows.len() == limit as usize { last } else { None };
        Ok(EventPage { events, next })
    }

    async fn read_incidents(
        &self,
        tenant_id: &str,
        filter: &IncidentFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Incident>, StorageError> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {INCIDENT_COLUMNS} FROM incidents"));
        push_incident_filters(&mut qb, tenant_id, filter);
        let order = filter.order.as_sql();
        qb.push(format_args!(" ORDER BY ts {order}, rowid {order}"));
        qb.push(" LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));

        let rows = qb.build().fetch_all(self.pool.inner()).await?;
        rows.iter().map(row_to_incident).collect()
    }

    async fn read_rules(&self, tenant_id: &str) -> Result<Vec<Rule>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE tenant_id = ? \
             ORDER BY priority DESC, created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(self.pool.inner())
        .await?;

        // A corrupt rule must not take the tenant's other rules down with it.
        Ok(rows
            .iter()
            .filter_map(|row| match row_to_rule(row) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(tenant_id, error = %e, "Skipping unreadable rule");
                    None
                }
            })
            .collect())
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "INSERT INTO rules ({RULE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(rule.id.to_string())
        .bind(&rule.tenant_id)
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(serde_json::to_string(&rule.condition)?)
        .bind(serde_json::to_string(&rule.actions)?)
        .bind(micros(rule.created_at))
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    async fn delete_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM rules WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(rule_id.to_string())
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn read_alert_rules(&self, tenant_id: &str) -> Result<Vec<AlertRule>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {ALERT_RULE_COLUMNS} FROM alert_rules WHERE tenant_id = ? ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(self.pool.inner())
        .await?;
        rows.iter().map(row_to_alert_rule).collect()
    }

    async fn insert_alert_rule(&self, rule: &AlertRule) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "INSERT INTO alert_rules ({ALERT_RULE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(rule.id.to_string())
        .bind(&rule.tenant_id)
        .bind(&rule.name)
        .bind(&rule.failure_type)
        .bind(&rule.node_name)
        .bind(&rule.webhook_url)
        .bind(micros(rule.created_at))
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    async fn delete_alert_rule(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM alert_rules WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(rule_id.to_string())
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(self.pool.inner()).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
