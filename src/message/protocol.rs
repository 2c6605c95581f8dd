//! Frame-level wire protocol.
//!
//! Every frame is one JSON object. Objects carrying a `type` key are
//! control frames (registration, keepalive); everything else is an
//! application [`Message`].

use super::Message;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// WebSocket close codes used by the broker.
pub mod close_code {
    /// Identity takeover and stale eviction.
    pub const NORMAL: u16 = 1000;
    /// Broker shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Missing or malformed agent identity in the connection path.
    pub const INVALID_PATH: u16 = 1003;
    /// Registry at capacity.
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

fn default_agent_type() -> String {
    "unknown".to_string()
}

/// Agent → Broker control frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Register {
        #[serde(default = "default_agent_type")]
        agent_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    Ping,
}

/// Broker → Agent control frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerControl {
    RegistrationConfirmed {
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

/// A classified inbound frame. `C` is the control vocabulary of the
/// receiving side.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<C> {
    Control(C),
    Message(Message),
}

/// Frame parsing errors
#[derive(Debug)]
pub enum ProtocolError {
    InvalidJson(String),
    NotAnObject,
    InvalidControl(String),
    InvalidMessage(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            ProtocolError::NotAnObject => write!(f, "frame is not a JSON object"),
            ProtocolError::InvalidControl(e) => write!(f, "invalid control frame: {}", e),
            ProtocolError::InvalidMessage(e) => write!(f, "invalid message: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Classify a text frame as a control frame or an application message.
pub fn classify<C: DeserializeOwned>(text: &str) -> Result<Frame<C>, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let is_control = match &value {
        Value::Object(map) => map.contains_key("type"),
        _ => return Err(ProtocolError::NotAnObject),
    };

    if is_control {
        serde_json::from_value(value)
            .map(Frame::Control)
            .map_err(|e| ProtocolError::InvalidControl(e.to_string()))
    } else {
        serde_json::from_value(value)
            .map(Frame::Message)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }
}

/// Parse a frame received by the broker.
pub fn parse_agent_frame(text: &str) -> Result<Frame<ControlMessage>, ProtocolError> {
    classify(text)
}

/// Parse a frame received by a client.
pub fn parse_broker_frame(text: &str) -> Result<Frame<ServerControl>, ProtocolError> {
    classify(text)
}
