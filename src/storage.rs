//! Storage Layer
//!
//! Everything durable sits behind the [`StoragePort`] trait so the engine
//! never depends on a concrete database:
//!
//! - [`SqliteStore`]: sqlx-backed SQLite (WAL mode, pooled connections)
//! - [`MemoryStore`]: in-process backend for `memory:` URLs and tests
//! - [`StorageBuilder`]: picks a backend from the URL and connects with retry
//!
//! Record types live in [`types`].

mod builder;
pub mod db;
mod error;
mod memory;
mod port;
pub mod schema;
mod sqlite_store;
pub mod types;

pub use builder::{MEMORY_URL, StorageBuilder};
pub use error::StorageError;
pub use memory::MemoryStore;
pub use port::StoragePort;
pub use sqlite_store::SqliteStore;
pub use types::{
    AlertRule, ConditionType, DetectedFailure, Event, EventCursor, EventFilter, EventPage,
    Incident, IncidentFilter,
    NewAlertRule, NewRule, Rule, RuleActions, RuleCondition, Severity, SortOrder, lookup,
    parse_timestamp, stringify,
};
