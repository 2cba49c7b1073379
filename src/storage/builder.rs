//! Storage builder.
//!
//! Picks a backend from the database URL and connects with retry.

use std::path::Path;
use std::sync::Arc;

use crate::backoff::BackoffPolicy;
use crate::storage::StorageError;
use crate::storage::db::DEFAULT_MAX_CONNECTIONS;
use crate::storage::memory::MemoryStore;
use crate::storage::port::StoragePort;
use crate::storage::sqlite_store::SqliteStore;

/// URL scheme selecting the in-process backend.
pub const MEMORY_URL: &str = "memory:";

/// Builder for constructing the storage backend.
#[derive(Debug, Clone)]
pub struct StorageBuilder {
    url: String,
    max_connections: u32,
    connect_retry: BackoffPolicy,
}

impl StorageBuilder {
    /// Create a new storage builder.
    ///
    /// `memory:` selects [`MemoryStore`]; anything else is a SQLite URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_retry: BackoffPolicy::default(),
        }
    }

    /// Set the connection pool size.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the retry schedule for the initial connection.
    pub fn connect_retry(mut self, policy: BackoffPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    /// Connect and return the backend behind the Storage Port.
    pub async fn build(self) -> Result<Arc<dyn StoragePort>, StorageError> {
        if self.url.starts_with(MEMORY_URL) {
            tracing::info!("Using in-memory storage");
            return Ok(Arc::new(MemoryStore::new()));
        }

        ensure_parent_dir(&self.url)?;

        let store = self
            .connect_retry
            .retry("storage connect", |_| {
                SqliteStore::open(&self.url, self.max_connections)
            })
            .await?;

        tracing::info!(max_connections = self.max_connections, "Storage initialized");
        Ok(Arc::new(store))
    }
}

/// Create the directory holding a file-backed database.
fn ensure_parent_dir(url: &str) -> Result<(), StorageError> {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let path = rest.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::Internal(format!(
                "Failed to create database directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}
