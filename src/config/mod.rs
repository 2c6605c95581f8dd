pub mod env;
pub use env::apply_env_overrides;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete range configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default)]
    pub brokers: BrokersConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Which of the three broker instances a setting applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerRole {
    /// General-purpose broker
    Main,
    /// Attacker population
    Red,
    /// Defender population
    Blue,
}

impl BrokerRole {
    pub const ALL: [BrokerRole; 3] = [BrokerRole::Main, BrokerRole::Red, BrokerRole::Blue];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerRole::Main => "main",
            BrokerRole::Red => "red",
            BrokerRole::Blue => "blue",
        }
    }
}

/// Broker endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokersConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_main_endpoint")]
    pub main: EndpointConfig,
    #[serde(default = "default_red_endpoint")]
    pub red: EndpointConfig,
    #[serde(default = "default_blue_endpoint")]
    pub blue: EndpointConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub port: u16,
    #[serde(default = "default_team_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_team_max_connections() -> usize {
    20
}

fn default_main_endpoint() -> EndpointConfig {
    EndpointConfig {
        port: 8080,
        max_connections: 50,
    }
}

fn default_red_endpoint() -> EndpointConfig {
    EndpointConfig {
        port: 8081,
        max_connections: default_team_max_connections(),
    }
}

fn default_blue_endpoint() -> EndpointConfig {
    EndpointConfig {
        port: 8082,
        max_connections: default_team_max_connections(),
    }
}

impl Default for BrokersConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            main: default_main_endpoint(),
            red: default_red_endpoint(),
            blue: default_blue_endpoint(),
        }
    }
}

impl BrokersConfig {
    pub fn endpoint(&self, role: BrokerRole) -> &EndpointConfig {
        match role {
            BrokerRole::Main => &self.main,
            BrokerRole::Red => &self.red,
            BrokerRole::Blue => &self.blue,
        }
    }

    pub fn endpoint_mut(&mut self, role: BrokerRole) -> &mut EndpointConfig {
        match role {
            BrokerRole::Main => &mut self.main,
            BrokerRole::Red => &mut self.red,
            BrokerRole::Blue => &mut self.blue,
        }
    }
}

/// Stale-connection sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// How often the sweep runs (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Inactivity after which a handle is evicted (seconds)
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_seconds: u64,
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    120
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
            stale_timeout_seconds: default_stale_timeout(),
        }
    }
}

impl LivenessConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_seconds)
    }
}

/// Agent-side connection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_ms: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_registration_timeout() -> u64 {
    5000
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            registration_timeout_ms: default_registration_timeout(),
            command_timeout_seconds: default_command_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl RangeConfig {
    /// Problems that make this configuration unusable. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.brokers.host.trim().is_empty() {
            problems.push("brokers.host must not be empty".to_string());
        }

        let mut seen_ports: Vec<(u16, BrokerRole)> = Vec::new();
        for role in BrokerRole::ALL {
            let endpoint = self.brokers.endpoint(role);
            if endpoint.max_connections == 0 {
                problems.push(format!(
                    "brokers.{}.max_connections must be greater than zero",
                    role.as_str()
                ));
            }
            // Port 0 asks the OS for a free port and may repeat
            if endpoint.port != 0 {
                if let Some((_, other)) = seen_ports.iter().find(|(p, _)| *p == endpoint.port) {
                    problems.push(format!(
                        "brokers.{} and brokers.{} share port {}",
                        other.as_str(),
                        role.as_str(),
                        endpoint.port
                    ));
                }
                seen_ports.push((endpoint.port, role));
            }
        }

        if self.liveness.sweep_interval_seconds == 0 {
            problems.push("liveness.sweep_interval_seconds must be greater than zero".to_string());
        }
        if self.liveness.stale_timeout_seconds == 0 {
            problems.push("liveness.stale_timeout_seconds must be greater than zero".to_string());
        }
        if self.client.max_reconnect_attempts == 0 {
            problems.push("client.max_reconnect_attempts must be at least 1".to_string());
        }
        if self.client.heartbeat_interval_seconds == 0 {
            problems.push("client.heartbeat_interval_seconds must be greater than zero".to_string());
        }

        problems
    }
}

/// Load a TOML configuration file into any config type with serde defaults.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load the range configuration, falling back to defaults when no path is
/// given, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<RangeConfig> {
    let mut config = match path {
        Some(path) => load_toml(path)?,
        None => RangeConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}
