//! In-process exercise agents.
//!
//! Each agent is a [`BrokerClient`] registered on its team's broker plus a
//! command handler that turns commands into executor tasks and replies to
//! whoever sent them.

pub mod commands;
pub mod handler;

pub use handler::{CommandHandler, NoticeHandler};

use crate::executor::TaskExecutor;
use cyber_range::client::{BrokerClient, ClientError, ClientSettings, ClientStatistics};
use cyber_range::config::{BrokerRole, ClientConfig};
use cyber_range::message::MessageType;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Command every agent acknowledges without running a task
pub const INITIALIZE: &str = "initialize";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Red,
    Blue,
}

impl Team {
    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Red => "red",
            Team::Blue => "blue",
        }
    }

    /// Name used in reports and scoring (`red_team` / `blue_team`)
    pub fn label(&self) -> &'static str {
        match self {
            Team::Red => "red_team",
            Team::Blue => "blue_team",
        }
    }

    /// Broker this team's agents connect to
    pub fn broker_role(&self) -> BrokerRole {
        match self {
            Team::Red => BrokerRole::Red,
            Team::Blue => BrokerRole::Blue,
        }
    }

    /// Response field carrying the technique or capability of a command
    pub fn technique_key(&self) -> &'static str {
        match self {
            Team::Red => "mitre_technique",
            Team::Blue => "defensive_capability",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Recon,
    SocialEngineering,
    Exploitation,
    LateralMovement,
    Detection,
    Response,
    ThreatIntel,
}

const RED_ROLES: [AgentRole; 4] = [
    AgentRole::Recon,
    AgentRole::SocialEngineering,
    AgentRole::Exploitation,
    AgentRole::LateralMovement,
];

const BLUE_ROLES: [AgentRole; 3] = [
    AgentRole::Detection,
    AgentRole::Response,
    AgentRole::ThreatIntel,
];

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::Recon,
        AgentRole::SocialEngineering,
        AgentRole::Exploitation,
        AgentRole::LateralMovement,
        AgentRole::Detection,
        AgentRole::Response,
        AgentRole::ThreatIntel,
    ];

    pub fn for_team(team: Team) -> &'static [AgentRole] {
        match team {
            Team::Red => &RED_ROLES,
            Team::Blue => &BLUE_ROLES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Recon => "recon",
            AgentRole::SocialEngineering => "social_engineering",
            AgentRole::Exploitation => "exploitation",
            AgentRole::LateralMovement => "lateral_movement",
            AgentRole::Detection => "detection",
            AgentRole::Response => "response",
            AgentRole::ThreatIntel => "threat_intel",
        }
    }

    pub fn team(&self) -> Team {
        match self {
            AgentRole::Recon
            | AgentRole::SocialEngineering
            | AgentRole::Exploitation
            | AgentRole::LateralMovement => Team::Red,
            AgentRole::Detection | AgentRole::Response | AgentRole::ThreatIntel => Team::Blue,
        }
    }

    /// Agent type declared when registering with the broker
    pub fn broker_type(&self) -> &'static str {
        match self {
            AgentRole::Recon => "red_team_recon",
            AgentRole::SocialEngineering => "red_team_social_engineering",
            AgentRole::Exploitation => "red_team_exploitation",
            AgentRole::LateralMovement => "red_team_lateral_movement",
            AgentRole::Detection => "blue_team_detection",
            AgentRole::Response => "blue_team_response",
            AgentRole::ThreatIntel => "blue_team_threat_intel",
        }
    }
}

/// `<role>_agent_<8 hex>`
pub fn generate_agent_id(role: AgentRole) -> String {
    format!("{}_agent_{:08x}", role.as_str(), rand::random::<u32>())
}

#[derive(Debug, Default)]
pub struct AgentCounters {
    handled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl AgentCounters {
    pub(crate) fn record(&self, success: bool) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-agent figures for the exercise report
#[derive(Debug, Clone, Serialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub role: AgentRole,
    pub team: Team,
    pub broker_type: &'static str,
    pub commands_handled: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub client: ClientStatistics,
}

pub struct ExerciseAgent {
    id: String,
    role: AgentRole,
    client: BrokerClient,
    counters: Arc<AgentCounters>,
}

impl ExerciseAgent {
    /// Build an agent for `role` that will connect to `broker_url`.
    pub fn new(
        role: AgentRole,
        broker_url: &str,
        policy: &ClientConfig,
        executor: Arc<dyn TaskExecutor>,
        task_timeout: Duration,
    ) -> Self {
        let id = generate_agent_id(role);
        let client = BrokerClient::new(ClientSettings::new(
            broker_url,
            id.as_str(),
            role.broker_type(),
            policy,
        ));
        let counters = Arc::new(AgentCounters::default());

        client.register_handler(
            MessageType::Command,
            Arc::new(CommandHandler::new(
                role,
                executor,
                task_timeout,
                Arc::clone(&counters),
            )),
        );
        let notices = Arc::new(NoticeHandler);
        client.register_handler(MessageType::Status, notices.clone());
        client.register_handler(MessageType::Error, notices);

        Self {
            id,
            role,
            client,
            counters,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn team(&self) -> Team {
        self.role.team()
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.client.start().await
    }

    pub async fn stop(&self) {
        self.client.stop().await;
    }

    pub fn performance(&self) -> AgentPerformance {
        AgentPerformance {
            agent_id: self.id.clone(),
            role: self.role,
            team: self.role.team(),
            broker_type: self.role.broker_type(),
            commands_handled: self.counters.handled.load(Ordering::Relaxed),
            commands_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            commands_failed: self.counters.failed.load(Ordering::Relaxed),
            client: self.client.statistics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;

    #[test]
    fn test_roles_split_into_teams() {
        assert_eq!(AgentRole::for_team(Team::Red).len(), 4);
        assert_eq!(AgentRole::for_team(Team::Blue).len(), 3);
        for role in AgentRole::ALL {
            assert!(AgentRole::for_team(role.team()).contains(&role));
            assert!(role.broker_type().starts_with(role.team().label()));
            assert!(role.broker_type().ends_with(role.as_str()));
        }
    }

    #[test]
    fn test_role_serde_names() {
        assert_eq!(
            serde_json::to_value(AgentRole::SocialEngineering).unwrap(),
            "social_engineering"
        );
        let role: AgentRole = serde_json::from_str(r#""threat_intel""#).unwrap();
        assert_eq!(role, AgentRole::ThreatIntel);
    }

    #[test]
    fn test_agent_id_format() {
        let id = generate_agent_id(AgentRole::LateralMovement);
        let suffix = id.strip_prefix("lateral_movement_agent_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(cyber_range::broker::validate_agent_id(&id).is_ok());
    }

    #[test]
    fn test_new_agent_is_idle() {
        let agent = ExerciseAgent::new(
            AgentRole::Detection,
            "ws://127.0.0.1:1",
            &ClientConfig::default(),
            Arc::new(SimulatedExecutor::new(Duration::ZERO)),
            Duration::from_secs(1),
        );

        assert_eq!(agent.team(), Team::Blue);
        assert!(agent.id().starts_with("detection_agent_"));

        let performance = agent.performance();
        assert_eq!(performance.commands_handled, 0);
        assert_eq!(performance.broker_type, "blue_team_detection");
        assert!(!performance.client.is_connected);
        assert_eq!(performance.client.registered_handlers.len(), 3);
    }
}
