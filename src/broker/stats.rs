use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-agent view of a live connection
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub agent_type: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
}

/// Read-only snapshot of a broker's connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatistics {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub is_running: bool,
    pub connected_agents: usize,
    pub max_connections: usize,
    pub total_connections: u64,
    pub total_messages: u64,
    pub server_start_time: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
    pub agents: Vec<AgentInfo>,
}
