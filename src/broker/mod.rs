//! Agent communication broker.
//!
//! Accepts WebSocket connections on `/ws/<agent_id>`, keeps at most one
//! live handle per agent id, routes unicast and broadcast messages, and
//! evicts connections that stop talking.

pub mod connection;
pub mod monitor;
pub mod router;
pub mod stats;


pub use connection::{ConnectionHandle, Outbound};
pub use router::create_router;
pub use stats::{AgentInfo, BrokerStatistics};

use crate::config::{BrokerRole, RangeConfig};
use crate::message::protocol::{self, close_code, ControlMessage, Frame, ServerControl};
use crate::message::{Message, BROADCAST, BROKER_ID};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_AGENT_ID_LEN: usize = 64;

/// Everything a broker instance needs to start
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub sweep_interval: Duration,
    pub stale_timeout: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &RangeConfig, role: BrokerRole) -> Self {
        let endpoint = config.brokers.endpoint(role);
        Self {
            name: role.as_str().to_string(),
            host: config.brokers.host.clone(),
            port: endpoint.port,
            max_connections: endpoint.max_connections,
            sweep_interval: config.liveness.sweep_interval(),
            stale_timeout: config.liveness.stale_timeout(),
        }
    }
}

/// Why a connection was not admitted
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptError {
    InvalidAgentId(String),
    AtCapacity { limit: usize },
}

impl AcceptError {
    pub fn close_code(&self) -> u16 {
        match self {
            AcceptError::InvalidAgentId(_) => close_code::INVALID_PATH,
            AcceptError::AtCapacity { .. } => close_code::TRY_AGAIN_LATER,
        }
    }

    pub fn close_reason(&self) -> &'static str {
        match self {
            AcceptError::InvalidAgentId(_) => "Invalid path",
            AcceptError::AtCapacity { .. } => "Server overloaded",
        }
    }
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::InvalidAgentId(reason) => write!(f, "invalid agent id: {}", reason),
            AcceptError::AtCapacity { limit } => {
                write!(f, "broker at capacity ({} connections)", limit)
            }
        }
    }
}

impl std::error::Error for AcceptError {}

/// Result of routing one message
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Delivered,
    Broadcast { recipients: usize },
    /// Receiver not registered; an error message went back to the sender
    UnknownRecipient,
    /// Receiver registered but its connection is already closing
    Undeliverable,
    /// Message could not be serialized
    Dropped,
}

/// Agent ids: 1-64 characters of `[A-Za-z0-9_.-]`, other than the
/// reserved `broadcast` and `broker`.
pub fn validate_agent_id(agent_id: &str) -> Result<(), AcceptError> {
    if agent_id.is_empty() {
        return Err(AcceptError::InvalidAgentId("empty".to_string()));
    }
    if agent_id == BROADCAST || agent_id == BROKER_ID {
        return Err(AcceptError::InvalidAgentId("reserved id".to_string()));
    }
    if agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(AcceptError::InvalidAgentId(format!(
            "longer than {} characters",
            MAX_AGENT_ID_LEN
        )));
    }
    if let Some(c) = agent_id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | '.'))
    {
        return Err(AcceptError::InvalidAgentId(format!(
            "invalid character '{}'",
            c
        )));
    }
    Ok(())
}

pub struct Broker {
    settings: BrokerSettings,
    /// agent_id -> live handle
    registry: DashMap<String, Arc<ConnectionHandle>>,
    /// Serializes takeover + capacity check + insert. Never held across an await.
    admission: Mutex<()>,
    running: AtomicBool,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            registry: DashMap::new(),
            admission: Mutex::new(()),
            running: AtomicBool::new(false),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            started_at: Mutex::new(None),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `ws://host:port` for clients of this broker, once started.
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("ws://{}", addr))
    }

    /// Bind the listener and spawn the server and liveness sweep.
    ///
    /// Returns the bound address, which differs from the configured port
    /// when port 0 was requested. Fails if already running or if the
    /// listener cannot bind.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::AcqRel) {
            bail!("broker '{}' is already running", self.settings.name);
        }

        let bind = (self.settings.host.as_str(), self.settings.port);
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e).with_context(|| {
                    format!(
                        "Failed to bind broker '{}' on {}:{}",
                        self.settings.name, self.settings.host, self.settings.port
                    )
                });
            }
        };
        let addr = listener
            .local_addr()
            .context("Failed to read bound broker address")?;

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

        let app = create_router(Arc::clone(self));
        let name = self.settings.name.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(broker = %name, error = %e, "Broker server failed");
            }
        });

        let sweep = tokio::spawn(monitor::run_liveness_sweep(
            Arc::clone(self),
            self.settings.sweep_interval,
            self.settings.stale_timeout,
        ));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([server, sweep]);

        info!(
            broker = %self.settings.name,
            addr = %addr,
            max_connections = self.settings.max_connections,
            "Broker started"
        );
        Ok(addr)
    }

    /// Admit a connection for `agent_id`.
    ///
    /// An existing handle for the same id is closed and removed first, then
    /// the capacity bound is checked. The whole sequence runs under the
    /// admission lock so concurrent accepts cannot overshoot the bound.
    pub fn admit(
        &self,
        agent_id: &str,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Arc<ConnectionHandle>, AcceptError> {
        validate_agent_id(agent_id)?;

        let _guard = self.admission.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((_, previous)) = self.registry.remove(agent_id) {
            warn!(
                broker = %self.settings.name,
                agent_id = %agent_id,
                "Agent id already connected, closing previous connection"
            );
            previous.close(close_code::NORMAL, "Replaced by new connection");
        }

        if self.registry.len() >= self.settings.max_connections {
            return Err(AcceptError::AtCapacity {
                limit: self.settings.max_connections,
            });
        }

        let handle = Arc::new(ConnectionHandle::new(agent_id, outbound));
        self.registry
            .insert(agent_id.to_string(), Arc::clone(&handle));
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Remove `handle` from the registry if it is still the registered
    /// handle for its agent id. A replaced connection never evicts its
    /// successor.
    pub fn release(&self, handle: &ConnectionHandle) -> bool {
        self.registry
            .remove_if(handle.agent_id(), |_, current| {
                current.connection_id() == handle.connection_id()
            })
            .is_some()
    }

    /// Process one inbound text frame from `handle`.
    pub fn handle_frame(&self, handle: &ConnectionHandle, text: &str) {
        handle.touch();

        let frame = match protocol::parse_agent_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    broker = %self.settings.name,
                    agent_id = %handle.agent_id(),
                    error = %e,
                    "Dropping malformed frame"
                );
                return;
            }
        };

        match frame {
            Frame::Control(ControlMessage::Register { agent_type, .. }) => {
                handle.register(&agent_type);
                info!(
                    broker = %self.settings.name,
                    agent_id = %handle.agent_id(),
                    agent_type = %agent_type,
                    "Agent registered"
                );
                handle.send_control(&ServerControl::RegistrationConfirmed {
                    agent_id: handle.agent_id().to_string(),
                    timestamp: Utc::now(),
                });
            }
            Frame::Control(ControlMessage::Ping) => {
                handle.send_control(&ServerControl::Pong {
                    timestamp: Utc::now(),
                });
            }
            Frame::Message(message) => {
                if !handle.is_registered() {
                    warn!(
                        broker = %self.settings.name,
                        agent_id = %handle.agent_id(),
                        message_id = %message.id(),
                        "Ignoring message from unregistered connection"
                    );
                    return;
                }
                handle.record_message();
                self.total_messages.fetch_add(1, Ordering::Relaxed);
                let message = message.with_sender(handle.agent_id());
                self.route(handle, message);
            }
        }
    }

    /// Deliver `message` on behalf of `sender`.
    pub fn route(&self, sender: &ConnectionHandle, message: Message) -> RouteOutcome {
        if !message.is_broadcast() && !self.registry.contains_key(message.receiver_id()) {
            warn!(
                broker = %self.settings.name,
                sender = %sender.agent_id(),
                receiver = %message.receiver_id(),
                "Unknown recipient"
            );
            sender.send_message(&Message::routing_error(&message));
            return RouteOutcome::UnknownRecipient;
        }

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!(message_id = %message.id(), error = %e, "Failed to serialize message");
                return RouteOutcome::Dropped;
            }
        };

        if message.is_broadcast() {
            let recipients: Vec<Arc<ConnectionHandle>> = self
                .registry
                .iter()
                .filter(|entry| entry.key() != sender.agent_id())
                .map(|entry| Arc::clone(entry.value()))
                .collect();

            let mut delivered = 0;
            for recipient in &recipients {
                if recipient.send_text(text.clone()) {
                    delivered += 1;
                } else {
                    debug!(agent_id = %recipient.agent_id(), "Broadcast recipient already closing");
                }
            }
            debug!(
                broker = %self.settings.name,
                sender = %sender.agent_id(),
                recipients = delivered,
                "Broadcast delivered"
            );
            return RouteOutcome::Broadcast {
                recipients: delivered,
            };
        }

        let recipient = self
            .registry
            .get(message.receiver_id())
            .map(|entry| Arc::clone(entry.value()));

        match recipient {
            Some(recipient) if recipient.send_text(text) => RouteOutcome::Delivered,
            Some(recipient) => {
                warn!(agent_id = %recipient.agent_id(), "Recipient connection is closing");
                RouteOutcome::Undeliverable
            }
            None => {
                // Recipient left between the lookup and the send
                sender.send_message(&Message::routing_error(&message));
                RouteOutcome::UnknownRecipient
            }
        }
    }

    /// Close and remove every handle idle for longer than `timeout`.
    /// Returns the evicted agent ids.
    pub fn evict_stale(&self, timeout: Duration) -> Vec<String> {
        let now_ms = Utc::now().timestamp_millis();
        let limit_ms = timeout.as_millis() as i64;

        // Collect first: removing while iterating would deadlock the shard
        let stale: Vec<Arc<ConnectionHandle>> = self
            .registry
            .iter()
            .filter(|entry| entry.value().idle_millis(now_ms) > limit_ms)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for handle in stale {
            if self.release(&handle) {
                handle.close(close_code::NORMAL, "Connection timed out");
                evicted.push(handle.agent_id().to_string());
            }
        }
        evicted
    }

    /// Close every live handle, then stop the listener and the sweep.
    /// Safe to call repeatedly and on a broker that never started.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);

        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.registry.remove(&id) {
                handle.close(close_code::GOING_AWAY, "Broker shutting down");
            }
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }

        if was_running {
            info!(broker = %self.settings.name, "Broker stopped");
        }
    }

    pub fn connected_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.registry.contains_key(agent_id)
    }

    /// Sorted ids of every registered agent.
    pub fn get_agent_list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn get_statistics(&self) -> BrokerStatistics {
        let started = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner);
        let uptime_seconds = match (started, self.is_running()) {
            (Some(at), true) => (Utc::now() - at).num_seconds(),
            _ => 0,
        };

        let mut agents: Vec<AgentInfo> = self.registry.iter().map(|e| e.value().info()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        BrokerStatistics {
            name: self.settings.name.clone(),
            host: self.settings.host.clone(),
            port: self
                .local_addr()
                .map(|a| a.port())
                .unwrap_or(self.settings.port),
            is_running: self.is_running(),
            connected_agents: agents.len(),
            max_connections: self.settings.max_connections,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            server_start_time: started,
            uptime_seconds,
            agents,
        }
    }
}
