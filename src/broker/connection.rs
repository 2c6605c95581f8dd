use super::stats::AgentInfo;
use super::Broker;
use crate::message::protocol::ServerControl;
use crate::message::Message;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Broker-side record of one live agent connection.
///
/// The socket itself is owned by the connection task; the handle only
/// holds the sending half of that task's outbound queue, so closing or
/// writing never blocks the caller.
#[derive(Debug)]
pub struct ConnectionHandle {
    agent_id: String,
    /// Distinguishes a replaced connection from its successor under the same id
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
    connected_at: DateTime<Utc>,
    /// Unix millis of the last inbound frame
    last_activity_ms: AtomicI64,
    message_count: AtomicU64,
    agent_type: RwLock<String>,
    registered: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(agent_id: impl Into<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            connection_id: Uuid::new_v4(),
            outbound,
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            message_count: AtomicU64::new(0),
            agent_type: RwLock::new("unknown".to_string()),
            registered: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn agent_type(&self) -> String {
        self.agent_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub(crate) fn register(&self, agent_type: &str) {
        *self
            .agent_type
            .write()
            .unwrap_or_else(PoisonError::into_inner) = agent_type.to_string();
        self.registered.store(true, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_message(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.connected_at)
    }

    /// Time since the last inbound frame, measured against `now_ms`.
    pub(crate) fn idle_millis(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity_ms.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: std::time::Duration) {
        let ms = Utc::now().timestamp_millis() - by.as_millis() as i64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    /// Queue a text frame. Returns false when the connection task is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    pub fn send_message(&self, message: &Message) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "Failed to serialize message");
                false
            }
        }
    }

    pub(crate) fn send_control(&self, control: &ServerControl) -> bool {
        match serde_json::to_string(control) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "Failed to serialize control frame");
                false
            }
        }
    }

    /// Ask the connection task to send a close frame and exit.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            message_count: self.message_count(),
        }
    }
}

/// Send a close frame on a socket that never made it into the registry.
pub(crate) async fn reject(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = socket.send(WsMessage::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame to rejected connection");
    }
}

/// Drive one accepted WebSocket until either side closes it.
pub(crate) async fn serve(broker: Arc<Broker>, agent_id: String, mut socket: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = match broker.admit(&agent_id, tx) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(broker = %broker.name(), agent_id = %agent_id, error = %e, "Connection refused");
            reject(socket, e.close_code(), e.close_reason()).await;
            return;
        }
    };

    info!(broker = %broker.name(), agent_id = %agent_id, "Agent connected");

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        broker.handle_frame(&handle, &text);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        handle.touch();
                        if let Err(e) = socket.send(WsMessage::Pong(data)).await {
                            warn!(agent_id = %agent_id, error = %e, "Failed to send pong");
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(agent_id = %agent_id, "Agent closed connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames only count as activity
                        handle.touch();
                    }
                    Some(Err(e)) => {
                        warn!(agent_id = %agent_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = socket.send(WsMessage::Text(text)).await {
                            warn!(agent_id = %agent_id, error = %e, "Failed to deliver frame");
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame { code, reason: reason.into() };
                        let _ = socket.send(WsMessage::Close(Some(frame))).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    broker.release(&handle);
    info!(broker = %broker.name(), agent_id = %agent_id, "Agent disconnected");
}
