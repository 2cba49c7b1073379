//! Wire frames and the transport seam.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::graph;
use crate::storage::{Event, Incident, Rule};

/// Frame kinds streamed to live viewers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FrameType {
    ExecutionGraph,
    IncidentCreated,
    RuleTriggered,
    ExecutionIngested,
    Heartbeat,
}

/// One outbound message: `{"type", "timestamp", "payload"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl StreamFrame {
    pub fn new(frame_type: FrameType, payload: Value) -> Self {
        Self {
            frame_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, Value::Object(Map::new()))
    }
}

/// A frame plus the attributes subscriber filters look at.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub frame: StreamFrame,
    /// Node the frame is about, for `node` filters.
    pub node: Option<String>,
    pub is_incident: bool,
    /// Fields matched by arbitrary key/value filters.
    pub attributes: Map<String, Value>,
}

impl LiveEvent {
    /// `execution_graph` frame for an ingested event.
    pub fn execution(event: &Event) -> Self {
        Self {
            frame: StreamFrame::new(
                FrameType::ExecutionGraph,
                Value::Object(event.payload.clone()),
            ),
            node: graph::primary_node_name(&event.payload),
            is_incident: false,
            attributes: event.payload.clone(),
        }
    }

    /// `incident_created` frame.
    pub fn incident(incident: &Incident) -> Self {
        let payload = serde_json::to_value(incident).unwrap_or(Value::Null);
        let attributes = match &payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Self {
            frame: StreamFrame::new(FrameType::IncidentCreated, payload),
            node: Some(incident.node_name.clone()),
            is_incident: true,
            attributes,
        }
    }

    /// `rule_triggered` frame for a rule match on `event`.
    pub fn rule_triggered(rule: &Rule, event: &Event) -> Self {
        let payload = json!({
            "rule_id": rule.id,
            "rule_name": rule.name,
            "condition": rule.condition.kind,
            "severity": rule.actions.severity,
            "execution_id": event.execution_id,
        });
        Self {
            frame: StreamFrame::new(FrameType::RuleTriggered, payload),
            node: graph::primary_node_name(&event.payload),
            is_incident: false,
            attributes: event.payload.clone(),
        }
    }
}

/// Errors from a subscriber transport. Any error tears the subscriber down.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection closed")]
    Closed,

    #[error("send timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where a subscriber's frames go.
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn send(&self, frame: &StreamFrame) -> Result<(), SinkError>;

    /// Called once after the broadcaster tears the subscriber down.
    async fn close(&self) {}
}

#[async_trait::async_trait]
impl FrameSink for tokio::sync::mpsc::Sender<StreamFrame> {
    async fn send(&self, frame: &StreamFrame) -> Result<(), SinkError> {
        tokio::sync::mpsc::Sender::send(self, frame.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DetectedFailure;

    #[test]
    fn test_frame_wire_shape() {
        let frame = StreamFrame::heartbeat();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["payload"], json!({}));
    }

    #[test]
    fn test_execution_tagged_with_first_node() {
        let event = Event::new(
            "t1",
            json!({"id": "e1", "nodes": [{"id": 1, "name": "root"}, {"id": 2, "parent_id": 1, "name": "leaf"}]}),
            Utc::now(),
        );
        let live = LiveEvent::execution(&event);
        assert_eq!(live.frame.frame_type, FrameType::ExecutionGraph);
        assert_eq!(live.node.as_deref(), Some("root"));
        assert!(!live.is_incident);
        assert_eq!(live.frame.payload["id"], "e1");
    }

    #[test]
    fn test_incident_frame() {
        let incident = Incident::open(&DetectedFailure {
            tenant_id: "t1".into(),
            execution_id: "x".into(),
            timestamp: Utc::now(),
            failure_type: "runtime_error".into(),
            node_name: "fetch".into(),
            summary: "boom".into(),
        });
        let live = LiveEvent::incident(&incident);
        assert!(live.is_incident);
        assert_eq!(live.node.as_deref(), Some("fetch"));
        assert_eq!(live.attributes["failure_type"], "runtime_error");
        assert_eq!(live.frame.frame_type.as_ref(), "incident_created");
    }
}
