//! Agent-side broker client.
//!
//! A [`BrokerClient`] keeps one WebSocket session to one broker on behalf
//! of one agent: it connects with bounded retries, registers, dispatches
//! inbound messages to type-keyed handlers, correlates responses with
//! pending requests, and reconnects after an unexpected disconnect.
//!
//! Handlers run one message at a time on a single dispatch task, in the
//! order the messages arrived. Responses to pending requests skip that
//! queue and resolve straight from the receive loop.

pub mod handler;

pub use handler::{ChannelHandler, MessageHandler};

use crate::config::ClientConfig;
use crate::message::protocol::{self, ControlMessage, Frame, ServerControl};
use crate::message::{Message, MessageType, Payload};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STOP_GRACE: Duration = Duration::from_secs(2);

/// Connection target and policy for one client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Broker base URL, e.g. `ws://127.0.0.1:8081`
    pub broker_url: String,
    pub agent_id: String,
    /// Type declared in the `register` frame
    pub agent_type: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub registration_timeout: Duration,
}

impl ClientSettings {
    pub fn new(
        broker_url: impl Into<String>,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        policy: &ClientConfig,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            reconnect_interval: Duration::from_millis(policy.reconnect_interval_ms),
            max_reconnect_attempts: policy.max_reconnect_attempts,
            heartbeat_interval: Duration::from_secs(policy.heartbeat_interval_seconds),
            registration_timeout: Duration::from_millis(policy.registration_timeout_ms),
        }
    }

    pub fn connect_url(&self) -> String {
        format!("{}/ws/{}", self.broker_url.trim_end_matches('/'), self.agent_id)
    }
}

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    ConnectFailed {
        url: String,
        attempts: u32,
        reason: String,
    },
    NotConnected,
    AlreadyStarted,
    Serialize(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ConnectFailed {
                url,
                attempts,
                reason,
            } => write!(
                f,
                "failed to connect to {} after {} attempts: {}",
                url, attempts, reason
            ),
            ClientError::NotConnected => write!(f, "client is not connected"),
            ClientError::AlreadyStarted => write!(f, "client already started"),
            ClientError::Serialize(e) => write!(f, "failed to serialize frame: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

/// Client-side counters
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatistics {
    pub agent_id: String,
    pub is_connected: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_count: u64,
    pub connection_time: Option<DateTime<Utc>>,
    pub registered_handlers: Vec<String>,
    pub pending_responses: usize,
}

struct Inner {
    settings: ClientSettings,
    /// Writer queue of the current session; `None` while disconnected
    outbound: RwLock<Option<mpsc::UnboundedSender<WsMessage>>>,
    /// message id -> waiter
    pending: DashMap<Uuid, oneshot::Sender<Message>>,
    handlers: DashMap<MessageType, Arc<dyn MessageHandler>>,
    connected: AtomicBool,
    stopping: AtomicBool,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnect_count: AtomicU64,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to one agent's broker session
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                outbound: RwLock::new(None),
                pending: DashMap::new(),
                handlers: DashMap::new(),
                connected: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                reconnect_count: AtomicU64::new(0),
                connected_at: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.settings.agent_id
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Register the handler for one message type, replacing any previous one.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.insert(message_type, handler);
    }

    /// Connect, register, and spawn the receive loop.
    ///
    /// Returns only after the broker confirmed registration, so messages
    /// sent afterwards are routed. Fails after the configured number of
    /// attempts.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(ClientError::AlreadyStarted);
        }
        self.inner.stopping.store(false, Ordering::Release);

        let (stream, early) = self.connect_with_retry().await?;
        let outbound_rx = self.open_session();

        let client = self.clone();
        let task = tokio::spawn(async move { client.run(stream, outbound_rx, early).await });
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Close the session and stop reconnecting. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);

        let outbound = self
            .inner
            .outbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = outbound {
            let _ = tx.send(WsMessage::Close(None));
        }

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if timeout(STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
            info!(agent_id = %self.agent_id(), "Client stopped");
        }
        self.close_session();
    }

    /// Send a message without waiting for anything in return.
    pub fn send_message(&self, message: Message) -> Result<(), ClientError> {
        let text =
            serde_json::to_string(&message).map_err(|e| ClientError::Serialize(e.to_string()))?;
        self.send_frame(WsMessage::Text(text))?;
        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send a `command` and wait for the response carrying the same id.
    ///
    /// `Ok(None)` means no response arrived within `wait`, or the
    /// connection dropped while waiting. Neither is an error.
    pub async fn send_command_and_wait(
        &self,
        receiver_id: &str,
        content: Payload,
        wait: Duration,
    ) -> Result<Option<Message>, ClientError> {
        let command = Message::command(self.agent_id(), receiver_id, content).expecting_response();
        let id = command.id();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        if let Err(e) = self.send_message(command) {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => {
                debug!(agent_id = %self.agent_id(), message_id = %id, "Pending response dropped on disconnect");
                Ok(None)
            }
            Err(_) => {
                self.inner.pending.remove(&id);
                debug!(agent_id = %self.agent_id(), message_id = %id, "No response before timeout");
                Ok(None)
            }
        }
    }

    /// Send a keepalive control frame.
    pub fn ping(&self) -> Result<(), ClientError> {
        let text = serde_json::to_string(&ControlMessage::Ping)
            .map_err(|e| ClientError::Serialize(e.to_string()))?;
        self.send_frame(WsMessage::Text(text))
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn statistics(&self) -> ClientStatistics {
        let mut registered_handlers: Vec<String> = self
            .inner
            .handlers
            .iter()
            .map(|e| e.key().as_str().to_string())
            .collect();
        registered_handlers.sort();

        ClientStatistics {
            agent_id: self.agent_id().to_string(),
            is_connected: self.is_connected(),
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            reconnect_count: self.inner.reconnect_count.load(Ordering::Relaxed),
            connection_time: *self
                .inner
                .connected_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            registered_handlers,
            pending_responses: self.inner.pending.len(),
        }
    }

    fn send_frame(&self, frame: WsMessage) -> Result<(), ClientError> {
        let guard = self
            .inner
            .outbound
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(frame).map_err(|_| ClientError::NotConnected)
    }

    /// Install a fresh writer queue and mark the client connected.
    fn open_session(&self) -> mpsc::UnboundedReceiver<WsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *self
            .inner
            .connected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.inner.connected.store(true, Ordering::Release);
        rx
    }

    /// Drop the writer queue and every pending waiter.
    fn close_session(&self) {
        *self
            .inner
            .outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.connected.store(false, Ordering::Release);

        // Waiters observe a closed channel and report "no response" now
        // instead of sitting out their full timeout
        let dropped = self.inner.pending.len();
        self.inner.pending.clear();
        if dropped > 0 {
            debug!(agent_id = %self.agent_id(), dropped, "Dropped pending responses");
        }
    }

    async fn connect_with_retry(&self) -> Result<(WsStream, Vec<Message>), ClientError> {
        let settings = &self.inner.settings;
        let attempts = settings.max_reconnect_attempts.max(1);
        let mut last_error = String::from("not attempted");

        for attempt in 1..=attempts {
            if self.inner.stopping.load(Ordering::Acquire) {
                last_error = "client stopping".to_string();
                break;
            }

            match self.connect_once().await {
                Ok(session) => {
                    info!(
                        agent_id = %settings.agent_id,
                        url = %settings.connect_url(),
                        attempt,
                        "Connected to broker"
                    );
                    return Ok(session);
                }
                Err(reason) => {
                    warn!(
                        agent_id = %settings.agent_id,
                        attempt,
                        max_attempts = attempts,
                        error = %reason,
                        "Connection attempt failed"
                    );
                    last_error = reason;
                }
            }

            if attempt < attempts {
                sleep(settings.reconnect_interval).await;
            }
        }

        Err(ClientError::ConnectFailed {
            url: settings.connect_url(),
            attempts,
            reason: last_error,
        })
    }

    /// One connect + register handshake. Messages that arrive before the
    /// confirmation are returned for delivery once the session is up.
    async fn connect_once(&self) -> Result<(WsStream, Vec<Message>), String> {
        let settings = &self.inner.settings;
        let (mut stream, _) = connect_async(settings.connect_url())
            .await
            .map_err(|e| e.to_string())?;

        let register = ControlMessage::Register {
            agent_type: settings.agent_type.clone(),
            agent_id: Some(settings.agent_id.clone()),
        };
        let text = serde_json::to_string(&register).map_err(|e| e.to_string())?;
        stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| e.to_string())?;

        let mut early = Vec::new();
        let handshake = async {
            while let Some(frame) = stream.next().await {
                match frame.map_err(|e| e.to_string())? {
                    WsMessage::Text(text) => match protocol::parse_broker_frame(&text) {
                        Ok(Frame::Control(ServerControl::RegistrationConfirmed { .. })) => {
                            return Ok(());
                        }
                        Ok(Frame::Message(message)) => early.push(message),
                        Ok(Frame::Control(_)) => {}
                        Err(e) => warn!(error = %e, "Malformed frame during registration"),
                    },
                    WsMessage::Close(frame) => {
                        let detail = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "no close frame".to_string());
                        return Err(format!("closed during registration: {}", detail));
                    }
                    _ => {}
                }
            }
            Err::<(), String>("connection ended during registration".to_string())
        };

        let outcome = timeout(settings.registration_timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => Ok((stream, early)),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err("registration not confirmed in time".to_string()),
        }
    }

    /// Receive loop for the lifetime of the client, across reconnects.
    async fn run(
        self,
        mut stream: WsStream,
        mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>,
        mut early: Vec<Message>,
    ) {
        // Lives across reconnects; ends once `dispatch` is dropped and drained
        let (dispatch, queue) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().dispatch(queue));

        loop {
            for message in early.drain(..) {
                self.deliver(message, &dispatch);
            }

            self.session(stream, outbound_rx, &dispatch).await;
            self.close_session();

            if self.inner.stopping.load(Ordering::Acquire) {
                break;
            }

            warn!(agent_id = %self.agent_id(), "Connection lost, reconnecting");
            match self.connect_with_retry().await {
                Ok((next_stream, next_early)) => {
                    self.inner.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    stream = next_stream;
                    early = next_early;
                    outbound_rx = self.open_session();
                }
                Err(e) => {
                    error!(agent_id = %self.agent_id(), error = %e, "Giving up on broker");
                    break;
                }
            }
        }
    }

    async fn session(
        &self,
        stream: WsStream,
        mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>,
        dispatch: &mpsc::UnboundedSender<Message>,
    ) {
        let (mut sink, mut source) = stream.split();

        let mut heartbeat = interval(self.inner.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => self.handle_text(&text, dispatch),
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(agent_id = %self.agent_id(), frame = ?frame, "Broker closed connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(agent_id = %self.agent_id(), error = %e, "WebSocket error");
                            break;
                        }
                        None => break,
                    }
                }

                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            let closing = matches!(frame, WsMessage::Close(_));
                            if let Err(e) = sink.send(frame).await {
                                warn!(agent_id = %self.agent_id(), error = %e, "Failed to send frame");
                                break;
                            }
                            if closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = self.ping() {
                        debug!(agent_id = %self.agent_id(), error = %e, "Heartbeat skipped");
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str, dispatch: &mpsc::UnboundedSender<Message>) {
        match protocol::parse_broker_frame(text) {
            Ok(Frame::Message(message)) => self.deliver(message, dispatch),
            Ok(Frame::Control(ServerControl::Pong { .. })) => {
                debug!(agent_id = %self.agent_id(), "Pong received");
            }
            Ok(Frame::Control(ServerControl::RegistrationConfirmed { .. })) => {
                debug!(agent_id = %self.agent_id(), "Duplicate registration confirmation");
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id(), error = %e, "Dropping malformed frame");
            }
        }
    }

    /// Resolve a pending request or queue the message for its handler.
    fn deliver(&self, message: Message, dispatch: &mpsc::UnboundedSender<Message>) {
        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);

        if message.message_type() == MessageType::Response {
            if let Some((_, waiter)) = self.inner.pending.remove(&message.id()) {
                let _ = waiter.send(message);
                return;
            }
        }

        if dispatch.send(message).is_err() {
            warn!(agent_id = %self.agent_id(), "Dispatch task gone, dropping message");
        }
    }

    /// Run handlers one message at a time, in arrival order.
    async fn dispatch(self, mut queue: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = queue.recv().await {
            let handler = self
                .inner
                .handlers
                .get(&message.message_type())
                .map(|entry| Arc::clone(entry.value()));

            match handler {
                Some(handler) => handler.handle(&self, message).await,
                None => {
                    warn!(
                        agent_id = %self.agent_id(),
                        message_type = message.message_type().as_str(),
                        sender = %message.sender_id(),
                        "No handler registered for message type"
                    );
                }
            }
        }
        debug!(agent_id = %self.agent_id(), "Dispatch task finished");
    }
}
