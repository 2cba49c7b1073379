//! WebSocket endpoints: filtered live frames and the raw ingest stream.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{MissedTickBehavior, interval_at, timeout};

use crate::fanout::{FrameSink, FrameType, SinkError, StreamFrame, SubscriptionFilter};
use crate::stream::IngestNotice;

use super::{AppState, Tenant};

/// How long a client has to send its subscription message.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat period on the raw ingest stream.
const LIVE_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
struct Handshake {
    #[serde(default)]
    filters: SubscriptionFilter,
}

/// Write half of a socket, shared between the handshake and the fanout
/// sender loop.
struct WsSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
    /// Flipped once the broadcaster has torn the subscription down.
    closed: watch::Sender<bool>,
}

impl WsSink {
    fn new(tx: SplitSink<WebSocket, Message>) -> Self {
        Self {
            tx: Mutex::new(tx),
            closed: watch::Sender::new(false),
        }
    }

    async fn send_text(&self, text: String) -> Result<(), SinkError> {
        self.tx
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close_with(&self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = self.tx.lock().await.send(Message::Close(Some(frame))).await;
    }
}

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send(&self, frame: &StreamFrame) -> Result<(), SinkError> {
        self.send_text(serde_json::to_string(frame)?).await
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.close_with(close_code::AWAY, "subscription ended").await;
    }
}

/// Read the first text message and parse it as a subscription request.
///
/// `Ok(None)` means the client went away before subscribing.
async fn read_handshake(rx: &mut SplitStream<WebSocket>) -> Result<Option<Handshake>, String> {
    let first = timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(msg) = rx.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .map_err(|_| "subscription message not received in time".to_string())?;

    match first {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| format!("invalid subscription message: {e}")),
        None => Ok(None),
    }
}

/// `GET /v1/stream`: subscribe to tenant frames through the broadcaster.
pub(super) async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_subscription(socket, state, tenant))
}

async fn serve_subscription(socket: WebSocket, state: Arc<AppState>, tenant: String) {
    let (tx, mut rx) = socket.split();
    let sink = Arc::new(WsSink::new(tx));

    let handshake = match read_handshake(&mut rx).await {
        Ok(Some(handshake)) => handshake,
        Ok(None) => return,
        Err(reason) => {
            tracing::debug!(tenant_id = %tenant, reason = %reason, "Rejected stream subscription");
            sink.close_with(close_code::UNSUPPORTED, "invalid subscription").await;
            return;
        }
    };

    let ack = json!({ "type": "subscribed", "status": "ok" }).to_string();
    if sink.send_text(ack).await.is_err() {
        return;
    }

    let mut torn_down = sink.closed.subscribe();
    let handle = state
        .fanout
        .subscribe(&tenant, handshake.filters, sink.clone() as Arc<dyn FrameSink>);
    tracing::info!(tenant_id = %tenant, subscription = %handle.id, "Stream client subscribed");

    // Anything the client sends after the handshake is ignored.
    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = torn_down.changed() => break,
        }
    }

    state.fanout.unsubscribe(&tenant, handle.id);
    tracing::info!(tenant_id = %tenant, subscription = %handle.id, "Stream client disconnected");
}

/// `GET /v1/live`: relay the tenant's ingest notices.
pub(super) async fn live_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    ws: WebSocketUpgrade,
) -> Response {
    let notices = state.stream.subscribe();
    ws.on_upgrade(move |socket| serve_live(socket, notices, tenant))
}

fn notice_frame(notice: &IngestNotice) -> Result<StreamFrame, serde_json::Error> {
    Ok(StreamFrame {
        frame_type: FrameType::ExecutionIngested,
        timestamp: notice.timestamp,
        payload: serde_json::to_value(notice)?,
    })
}

async fn serve_live(
    socket: WebSocket,
    mut notices: broadcast::Receiver<IngestNotice>,
    tenant: String,
) {
    let (tx, mut rx) = socket.split();
    let sink = WsSink::new(tx);
    let mut heartbeat = interval_at(tokio::time::Instant::now() + LIVE_HEARTBEAT, LIVE_HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(tenant_id = %tenant, "Live client connected");
    loop {
        let frame = tokio::select! {
            notice = notices.recv() => match notice {
                Ok(notice) if notice.tenant_id == tenant => match notice_frame(&notice) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode ingest notice");
                        continue;
                    }
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(tenant_id = %tenant, skipped, "Live client lagging, notices skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => StreamFrame::heartbeat(),
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        if let Err(e) = sink.send(&frame).await {
            tracing::debug!(tenant_id = %tenant, error = %e, "Live client send failed");
            break;
        }
    }
    tracing::debug!(tenant_id = %tenant, "Live client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_handshake_parsing() {
        let hs: Handshake =
            serde_json::from_str(r#"{"filters": {"node": "fetch", "incident_only": true}}"#)
                .unwrap();
        assert_eq!(hs.filters.node.as_deref(), Some("fetch"));
        assert!(hs.filters.incident_only);

        let hs: Handshake = serde_json::from_str("{}").unwrap();
        assert_eq!(hs.filters, SubscriptionFilter::default());

        assert!(serde_json::from_str::<Handshake>("not json").is_err());
    }

    #[test]
    fn test_notice_frame() {
        let notice = IngestNotice::ingested("acme", Some("e1".into()), Utc::now());
        let frame = notice_frame(&notice).unwrap();
        assert_eq!(frame.frame_type, FrameType::ExecutionIngested);
        assert_eq!(frame.timestamp, notice.timestamp);
        assert_eq!(frame.payload["type"], "execution_ingested");
        assert_eq!(frame.payload["execution_id"], "e1");
    }
}
