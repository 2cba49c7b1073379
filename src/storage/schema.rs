//! Database schema definitions.
//!
//! Timestamps are stored as microseconds since the Unix epoch.

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Ingested events (append-only).
///
/// Known envelope fields are denormalised into columns for filtering;
/// `payload` keeps the original body as JSON text.
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id    TEXT NOT NULL,
    event_id     TEXT,
    execution_id TEXT,
    status       TEXT,
    cluster_id   TEXT,
    duration     REAL,
    ts           INTEGER NOT NULL,
    ingested_at  INTEGER NOT NULL,
    payload      TEXT NOT NULL
)
"#;

pub const EVENTS_INDEX_DDL: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_tenant_ts ON events (tenant_id, ts)";

/// Node names per event, for `node_name` filters.
pub const EVENT_NODES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS event_nodes (
    event_seq INTEGER NOT NULL REFERENCES events (seq),
    name      TEXT NOT NULL
)
"#;

pub const EVENT_NODES_INDEX_DDL: &str =
    "CREATE INDEX IF NOT EXISTS idx_event_nodes_seq ON event_nodes (event_seq, name)";

/// Deduplicated incidents.
pub const INCIDENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS incidents (
    id               TEXT PRIMARY KEY,
    tenant_id        TEXT NOT NULL,
    execution_id     TEXT NOT NULL,
    ts               INTEGER NOT NULL,
    failure_type     TEXT NOT NULL,
    node_name        TEXT NOT NULL,
    summary          TEXT NOT NULL,
    fingerprint      TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1
)
"#;

pub const INCIDENTS_INDEX_DDL: &str = "CREATE INDEX IF NOT EXISTS idx_incidents_fingerprint \
     ON incidents (tenant_id, fingerprint, ts)";

/// Tenant rules. Condition and actions are JSON documents.
pub const RULES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS rules (
    id         TEXT PRIMARY KEY,
    tenant_id  TEXT NOT NULL,
    name       TEXT NOT NULL,
    enabled    INTEGER NOT NULL DEFAULT 1,
    priority   INTEGER NOT NULL DEFAULT 0,
    condition  TEXT NOT NULL,
    actions    TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

/// Webhook routing rules.
pub const ALERT_RULES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS alert_rules (
    id           TEXT PRIMARY KEY,
    tenant_id    TEXT NOT NULL,
    name         TEXT NOT NULL,
    failure_type TEXT NOT NULL,
    node_name    TEXT,
    webhook_url  TEXT,
    created_at   INTEGER NOT NULL
)
"#;

const SCHEMA: [&str; 8] = [
    EVENTS_TABLE_DDL,
    EVENTS_INDEX_DDL,
    EVENT_NODES_TABLE_DDL,
    EVENT_NODES_INDEX_DDL,
    INCIDENTS_TABLE_DDL,
    INCIDENTS_INDEX_DDL,
    RULES_TABLE_DDL,
    ALERT_RULES_TABLE_DDL,
];

/// Initialize the database schema.
///
/// Creates all tables and indexes that don't exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in SCHEMA {
        sqlx::query(ddl).execute(pool.inner()).await?;
    }
    Ok(())
}
