// Message model and wire protocol
pub mod message;

// Broker: connection registry, routing, liveness
pub mod broker;

// Team broker variants (attack and defense side state)
pub mod team;

// Agent-side client
pub mod client;

// Scenario catalog
pub mod scenario;

// Configuration
pub mod config;

pub use broker::{Broker, BrokerSettings};
pub use client::{BrokerClient, ClientSettings, MessageHandler};
pub use message::{Message, MessageType, Priority};
