pub mod protocol;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Receiver id meaning "every registered agent except the sender".
pub const BROADCAST: &str = "broadcast";

/// Sender id stamped on messages the broker itself originates.
pub const BROKER_ID: &str = "broker";

/// Well-known receiver id of the exercise coordinator.
pub const COORDINATOR_ID: &str = "coordinator";

pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Command,
    Response,
    Alert,
    Status,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::Alert => "alert",
            MessageType::Status => "status",
            MessageType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Application message exchanged between agents through a broker.
///
/// Fields are private so a message cannot be altered after construction;
/// the consuming `with_*` builders finish a message before it is sent.
/// Fields missing on the wire take the defaults the broker has always
/// accepted (fresh id, empty payload, `command`, `normal` priority).
/// A present `id` must be a UUID string. A frame with any other id does
/// not parse as a message and is dropped like any other malformed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    #[serde(default)]
    sender_id: String,
    #[serde(default)]
    receiver_id: String,
    #[serde(default)]
    message_type: MessageType,
    #[serde(default)]
    content: Payload,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    requires_response: bool,
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        message_type: MessageType,
        content: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            message_type,
            content,
            timestamp: Utc::now(),
            priority: Priority::Normal,
            requires_response: false,
        }
    }

    pub fn command(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: Payload,
    ) -> Self {
        Self::new(sender_id, receiver_id, MessageType::Command, content)
    }

    /// Build the response to this message.
    ///
    /// The response reuses this message's id so the original requester can
    /// correlate it with its pending entry.
    pub fn reply(&self, from: impl Into<String>, content: Payload) -> Self {
        Self {
            id: self.id,
            sender_id: from.into(),
            receiver_id: self.sender_id.clone(),
            message_type: MessageType::Response,
            content,
            timestamp: Utc::now(),
            priority: self.priority,
            requires_response: false,
        }
    }

    /// Error the broker returns to a sender whose receiver is not registered.
    pub fn routing_error(original: &Message) -> Self {
        let content = json!({
            "error": "Unknown recipient",
            "receiver_id": original.receiver_id,
            "original_message_id": original.id,
        });
        let mut error = Self::new(
            BROKER_ID,
            original.sender_id.clone(),
            MessageType::Error,
            into_payload(content),
        );
        error.priority = Priority::High;
        error
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Stamp the identity the message actually arrived from.
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn content(&self) -> &Payload {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn requires_response(&self) -> bool {
        self.requires_response
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }

    /// String field of the payload, if present.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

/// Convert a `json!` object literal into a payload. Non-object values are
/// wrapped under a `value` key.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
