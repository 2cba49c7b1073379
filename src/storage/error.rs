//! Storage-specific error types.
//!
//! Every [`StoragePort`](crate::storage::StoragePort) call returns
//! [`StorageError`] on failure. Callers on the ingestion path never surface
//! these to producers; they retry or degrade instead.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend is not reachable or has been closed.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Internal error (e.g., poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data in storage (e.g., unknown enum value).
    #[error("invalid data: {0}")]
    InvalidData(String),
}
