//! Runner configuration.
//!
//! A runner config file is a range config (`[brokers]`, `[liveness]`,
//! `[client]`) plus the `[exercise]`, `[report]` and `[executor]` sections
//! below. Every field has a default, so a partial or missing file is valid.

use crate::agent::{AgentRole, Team};
use crate::coordinator::SimulationPhase;
use anyhow::Result;
use cyber_range::config::{apply_env_overrides, load_toml, RangeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(flatten)]
    pub range: RangeConfig,
    #[serde(default)]
    pub exercise: ExerciseConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseConfig {
    /// Hard wall-clock limit for the run loop
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Pause between run-loop iterations
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Per-command executor timeout inside each agent
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,
    #[serde(default = "default_red_agents")]
    pub red_agents: Vec<AgentRole>,
    #[serde(default = "default_blue_agents")]
    pub blue_agents: Vec<AgentRole>,
    #[serde(default)]
    pub phase_durations: PhaseDurations,
}

/// One week
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

fn default_timeout_minutes() -> u64 {
    60
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_task_timeout() -> u64 {
    300
}

fn default_red_agents() -> Vec<AgentRole> {
    AgentRole::for_team(Team::Red).to_vec()
}

fn default_blue_agents() -> Vec<AgentRole> {
    AgentRole::for_team(Team::Blue).to_vec()
}

impl Default for ExerciseConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            tick_interval_ms: default_tick_interval(),
            task_timeout_seconds: default_task_timeout(),
            red_agents: default_red_agents(),
            blue_agents: default_blue_agents(),
            phase_durations: PhaseDurations::default(),
        }
    }
}

impl ExerciseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    /// Red roster followed by blue roster.
    pub fn roster(&self) -> Vec<AgentRole> {
        self.red_agents
            .iter()
            .chain(self.blue_agents.iter())
            .copied()
            .collect()
    }
}

/// Seconds spent in each phase before advancing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseDurations {
    pub initialization: u64,
    pub reconnaissance: u64,
    pub initial_access: u64,
    pub execution: u64,
    pub persistence: u64,
    pub defense_response: u64,
    pub lateral_movement: u64,
    pub exfiltration: u64,
    pub post_incident: u64,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            initialization: 120,
            reconnaissance: 600,
            initial_access: 480,
            execution: 720,
            persistence: 360,
            defense_response: 600,
            lateral_movement: 480,
            exfiltration: 360,
            post_incident: 300,
        }
    }
}

impl PhaseDurations {
    /// Same duration for every phase.
    pub fn uniform(seconds: u64) -> Self {
        Self {
            initialization: seconds,
            reconnaissance: seconds,
            initial_access: seconds,
            execution: seconds,
            persistence: seconds,
            defense_response: seconds,
            lateral_movement: seconds,
            exfiltration: seconds,
            post_incident: seconds,
        }
    }

    fn seconds(&self, phase: SimulationPhase) -> u64 {
        match phase {
            SimulationPhase::Initialization => self.initialization,
            SimulationPhase::Reconnaissance => self.reconnaissance,
            SimulationPhase::InitialAccess => self.initial_access,
            SimulationPhase::Execution => self.execution,
            SimulationPhase::Persistence => self.persistence,
            SimulationPhase::DefenseResponse => self.defense_response,
            SimulationPhase::LateralMovement => self.lateral_movement,
            SimulationPhase::Exfiltration => self.exfiltration,
            SimulationPhase::PostIncident => self.post_incident,
            SimulationPhase::Completed => 0,
        }
    }

    pub fn get(&self, phase: SimulationPhase) -> Duration {
        Duration::from_secs(self.seconds(phase))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_directory")]
    pub directory: PathBuf,
}

fn default_report_directory() -> PathBuf {
    PathBuf::from("reports")
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            directory: default_report_directory(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Simulated,
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub kind: ExecutorKind,
    /// Required for the http executor
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Artificial delay of the simulated executor
    #[serde(default)]
    pub latency_ms: u64,
}

impl RunnerConfig {
    /// Problems that make this configuration unusable. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.range.validate();
        let exercise = &self.exercise;

        if exercise.timeout_minutes == 0 {
            problems.push("exercise.timeout_minutes must be greater than zero".to_string());
        }
        if exercise.timeout_minutes > MAX_TIMEOUT_MINUTES {
            problems.push(format!(
                "exercise.timeout_minutes must be at most {}",
                MAX_TIMEOUT_MINUTES
            ));
        }
        if exercise.tick_interval_ms == 0 {
            problems.push("exercise.tick_interval_ms must be greater than zero".to_string());
        }
        if exercise.task_timeout_seconds == 0 {
            problems.push("exercise.task_timeout_seconds must be greater than zero".to_string());
        }

        for phase in SimulationPhase::ACTIVE {
            if exercise.phase_durations.seconds(phase) == 0 {
                problems.push(format!(
                    "exercise.phase_durations.{} must be greater than zero",
                    phase.as_str()
                ));
            }
        }

        for (team, key, roster) in [
            (Team::Red, "red_agents", &exercise.red_agents),
            (Team::Blue, "blue_agents", &exercise.blue_agents),
        ] {
            if roster.is_empty() {
                problems.push(format!("exercise.{} must not be empty", key));
            }
            for (i, role) in roster.iter().enumerate() {
                if role.team() != team {
                    problems.push(format!(
                        "exercise.{} contains {} which is not a {} role",
                        key,
                        role.as_str(),
                        team.as_str()
                    ));
                }
                if roster[..i].contains(role) {
                    problems.push(format!(
                        "exercise.{} lists {} more than once",
                        key,
                        role.as_str()
                    ));
                }
            }
        }

        if self.executor.kind == ExecutorKind::Http
            && self
                .executor
                .endpoint
                .as_deref()
                .map_or(true, |e| e.trim().is_empty())
        {
            problems.push("executor.endpoint is required when executor.kind = \"http\"".to_string());
        }

        problems
    }
}

/// Load the runner configuration (defaults when no path is given), then
/// apply environment overrides.
pub fn load_runner_config(path: Option<&Path>) -> Result<RunnerConfig> {
    let mut config = match path {
        Some(path) => load_toml(path)?,
        None => RunnerConfig::default(),
    };
    apply_env_overrides(&mut config.range);
    apply_executor_override(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// `RANGE_EXECUTOR_URL` selects the http executor at that endpoint.
pub fn apply_executor_override<F>(config: &mut RunnerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("RANGE_EXECUTOR_URL") {
        if !url.trim().is_empty() {
            config.executor.kind = ExecutorKind::Http;
            config.executor.endpoint = Some(url);
        }
    }
}
