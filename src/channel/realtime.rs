//! Realtime channel client over WebSocket.
//!
//! Speaks the Phoenix-channel wire protocol used by the hosted channel
//! service: `phx_join` to subscribe, 30s heartbeats on the `phoenix` topic,
//! `presence_state`/`presence_diff` for presence, and `broadcast` frames for
//! application messages. A reader task owns the socket receive half and
//! converts frames into [`ChannelEvent`]s; all tasks hang off one
//! cancellation token so `leave()` is a single deterministic teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{room_id, Channel, ChannelEvent, PresenceRecord};
use crate::error::CallError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_QUEUE_DEPTH: usize = 64;
const JOIN_REF: &str = "1";

/// One Phoenix socket frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SocketMessage {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref")]
    msg_ref: Option<String>,
}

/// Channel service client for one call room.
pub struct RealtimeChannel {
    endpoint: Url,
    topic: String,
    cancel: CancellationToken,
    next_ref: AtomicU64,
    writer: Mutex<Option<mpsc::Sender<Message>>>,
}

impl RealtimeChannel {
    /// Build a client for the room derived from `call_id`. The endpoint is
    /// the service's socket URL (`wss://.../socket/websocket?...`).
    pub fn new(endpoint: &str, call_id: &str) -> Result<Self, CallError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| CallError::ChannelSendFailure(format!("bad channel endpoint: {e}")))?;
        Ok(Self {
            endpoint,
            topic: format!("realtime:{}", room_id(call_id)),
            cancel: CancellationToken::new(),
            next_ref: AtomicU64::new(2), // 1 is reserved for the join
            writer: Mutex::new(None),
        })
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn push(&self, event: &str, payload: Value) -> Result<(), CallError> {
        let msg = SocketMessage {
            topic: self.topic.clone(),
            event: event.to_string(),
            payload,
            msg_ref: Some(self.next_ref()),
        };
        let text = serde_json::to_string(&msg)
            .map_err(|e| CallError::ChannelSendFailure(format!("frame serialize: {e}")))?;

        let writer = self.writer.lock().await;
        let tx = writer
            .as_ref()
            .ok_or_else(|| CallError::ChannelSendFailure("channel not joined".into()))?;
        tx.send(Message::Text(text))
            .await
            .map_err(|_| CallError::ChannelSendFailure("socket writer closed".into()))
    }
}

#[async_trait]
impl Channel for RealtimeChannel {
    async fn join(&self) -> Result<mpsc::Receiver<ChannelEvent>, CallError> {
        let (stream, response) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| CallError::ChannelSendFailure(format!("WebSocket connect: {e}")))?;
        tracing::info!(
            "channel socket connected (status={}), joining {}",
            response.status(),
            self.topic
        );

        let (sink, ws_rx) = stream.split();

        let (write_tx, write_rx) = mpsc::channel::<Message>(EVENT_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_QUEUE_DEPTH);
        let (ack_tx, ack_rx) = oneshot::channel::<Result<(), String>>();

        // Per-connection token: a failed join tears down only this socket's
        // tasks, while leave() still cancels through the parent.
        let conn = self.cancel.child_token();
        tokio::spawn(write_loop(write_rx, sink, conn.clone()));
        tokio::spawn(read_loop(
            ws_rx,
            self.topic.clone(),
            event_tx,
            ack_tx,
            conn.clone(),
        ));
        tokio::spawn(heartbeat_loop(write_tx.clone(), conn.clone()));

        *self.writer.lock().await = Some(write_tx);

        let join = SocketMessage {
            topic: self.topic.clone(),
            event: "phx_join".to_string(),
            payload: serde_json::json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" }
                }
            }),
            msg_ref: Some(JOIN_REF.to_string()),
        };
        let text = serde_json::to_string(&join)
            .map_err(|e| CallError::ChannelSendFailure(format!("join serialize: {e}")))?;
        {
            let writer = self.writer.lock().await;
            if let Some(tx) = writer.as_ref() {
                tx.send(Message::Text(text))
                    .await
                    .map_err(|_| CallError::ChannelSendFailure("socket writer closed".into()))?;
            }
        }

        let joined = match time::timeout(JOIN_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(CallError::ChannelSendFailure(format!(
                "join rejected: {reason}"
            ))),
            Ok(Err(_)) => Err(CallError::ChannelSendFailure(
                "socket closed before join ack".into(),
            )),
            Err(_) => Err(CallError::ChannelSendFailure("join ack timed out".into())),
        };
        if let Err(e) = joined {
            // The subscription never existed; kill this socket's tasks and
            // refuse later sends instead of queueing into a dead topic.
            conn.cancel();
            *self.writer.lock().await = None;
            return Err(e);
        }
        Ok(event_rx)
    }

    async fn track(&self, presence: &PresenceRecord) -> Result<(), CallError> {
        let record = serde_json::to_value(presence)
            .map_err(|e| CallError::ChannelSendFailure(format!("presence serialize: {e}")))?;
        self.push(
            "presence",
            serde_json::json!({
                "type": "presence",
                "event": "track",
                "payload": record
            }),
        )
        .await
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), CallError> {
        self.push(
            "broadcast",
            serde_json::json!({
                "type": "broadcast",
                "event": event,
                "payload": payload
            }),
        )
        .await
    }

    async fn leave(&self) -> Result<(), CallError> {
        // Best effort goodbye, then cut every task down.
        let _ = self.push("phx_leave", serde_json::json!({})).await;
        self.cancel.cancel();
        *self.writer.lock().await = None;
        Ok(())
    }
}

/// Pumps outbound messages into the socket sink.
async fn write_loop(
    mut rx: mpsc::Receiver<Message>,
    mut sink: WsSink,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!("socket send failed: {e}");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sink.close().await;
}

/// Converts inbound socket frames into channel events.
async fn read_loop(
    mut stream: WsStream,
    topic: String,
    events: mpsc::Sender<ChannelEvent>,
    ack: oneshot::Sender<Result<(), String>>,
    cancel: CancellationToken,
) {
    let mut ack = Some(ack);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                tracing::trace!("channel recv: {text}");
                let msg: SocketMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!("unparseable channel frame ignored: {e}");
                        continue;
                    }
                };
                if msg.topic != topic && msg.topic != "phoenix" {
                    continue;
                }
                // Join acknowledgement is a phx_reply carrying our join ref.
                if msg.event == "phx_reply" && msg.msg_ref.as_deref() == Some(JOIN_REF) {
                    if let Some(ack) = ack.take() {
                        let status = msg
                            .payload
                            .get("status")
                            .and_then(Value::as_str)
                            .unwrap_or("error");
                        let result = if status == "ok" {
                            Ok(())
                        } else {
                            Err(msg.payload.to_string())
                        };
                        let _ = ack.send(result);
                    }
                    continue;
                }
                for event in map_socket_message(&msg) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_))) => {
                // tungstenite answers pings automatically on flush.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!("channel socket closed: {:?}", frame);
                break;
            }
            Some(Ok(other)) => {
                tracing::trace!("channel frame ignored: {:?}", other);
            }
            Some(Err(e)) => {
                tracing::warn!("channel socket error: {e}");
                break;
            }
            None => break,
        }
    }
    // Receiver side sees the stream end and treats it as a disconnect.
}

/// Keeps the socket alive with protocol-level heartbeats.
async fn heartbeat_loop(writer: mpsc::Sender<Message>, cancel: CancellationToken) {
    let mut interval = time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await; // skip the immediate first tick
    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        seq += 1;
        let beat = serde_json::json!({
            "topic": "phoenix",
            "event": "heartbeat",
            "payload": {},
            "ref": format!("hb-{seq}"),
        });
        if writer.send(Message::Text(beat.to_string())).await.is_err() {
            break;
        }
    }
}

/// Map one protocol frame to the channel events it carries.
fn map_socket_message(msg: &SocketMessage) -> Vec<ChannelEvent> {
    match msg.event.as_str() {
        "presence_state" => vec![ChannelEvent::PresenceSync(parse_presence_map(&msg.payload))],
        "presence_diff" => {
            let mut events = Vec::new();
            if let Some(joins) = msg.payload.get("joins") {
                for record in parse_presence_map(joins) {
                    events.push(ChannelEvent::PresenceJoin(record));
                }
            }
            if let Some(leaves) = msg.payload.get("leaves") {
                for record in parse_presence_map(leaves) {
                    events.push(ChannelEvent::PresenceLeave(record));
                }
            }
            events
        }
        "broadcast" => {
            let event = msg
                .payload
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let payload = msg.payload.get("payload").cloned().unwrap_or(Value::Null);
            vec![ChannelEvent::Broadcast { event, payload }]
        }
        _ => Vec::new(),
    }
}

/// Flatten a Phoenix presence map (`{key: {metas: [..]}}`) into records.
/// Metas that do not carry our presence fields are skipped.
fn parse_presence_map(v: &Value) -> Vec<PresenceRecord> {
    let Some(map) = v.as_object() else {
        return Vec::new();
    };
    map.values()
        .filter_map(|entry| entry.get("metas").and_then(Value::as_array))
        .flatten()
        .filter_map(|meta| serde_json::from_value(meta.clone()).ok())
        .collect()
}
