//! Heuristic failure detection.
//!
//! [`FailureDetector`] is the fallback used when no tenant rule matches an
//! event: it scans the node list in the order the producer sent it and
//! flags the first node whose metadata mentions an error, exception or
//! traceback. Embedded `children` are not searched.

use serde_json::Value;

use crate::graph::{self, UNKNOWN_NODE};
use crate::storage::{DetectedFailure, Event, parse_timestamp};

/// Markers searched for (lowercased) in node metadata.
pub const FAILURE_MARKERS: [&str; 3] = ["error", "exception", "traceback"];

/// Failure type assigned by the heuristic detector.
pub const RUNTIME_ERROR: &str = "runtime_error";

const DETECTION_SUMMARY: &str = "Execution failure detected in node metadata.";

/// Execution id used when the event carries none.
pub const UNKNOWN_EXECUTION: &str = "unknown";

/// Stable grouping key for `(failure_type, node_name)`.
///
/// First 32 hex characters of a blake3 digest.
pub fn fingerprint(failure_type: &str, node_name: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(failure_type.as_bytes());
    hasher.update(b"|");
    hasher.update(node_name.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex[..32].to_string()
}

/// Whether the serialized, lowercased value contains any of `markers`.
pub fn contains_marker(value: &Value, markers: &[&str]) -> bool {
    let text = match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    markers.iter().any(|marker| text.contains(marker))
}

/// Stateless detector for failure signatures in node metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailureDetector;

impl FailureDetector {
    pub fn new() -> Self {
        Self
    }

    /// Inspect one event. The first matching node wins.
    ///
    /// Payloads without a node list, non-object nodes and non-object
    /// metadata are treated as "nothing to see".
    pub fn detect(&self, event: &Event) -> Option<DetectedFailure> {
        let node = graph::node_list(&event.payload)?
            .iter()
            .filter_map(Value::as_object)
            .find(|node| {
                node.get("metadata")
                    .filter(|meta| meta.is_object())
                    .is_some_and(|meta| contains_marker(meta, &FAILURE_MARKERS))
            })?;

        let timestamp = ["created_at", "timestamp"]
            .iter()
            .find_map(|key| node.get(*key).and_then(parse_timestamp))
            .unwrap_or(event.timestamp);

        Some(DetectedFailure {
            tenant_id: event.tenant_id.clone(),
            execution_id: event
                .execution_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_EXECUTION.to_string()),
            timestamp,
            failure_type: RUNTIME_ERROR.to_string(),
            node_name: graph::node_name(node).unwrap_or(UNKNOWN_NODE).to_string(),
            summary: DETECTION_SUMMARY.to_string(),
        })
    }
}
