use super::phase::SimulationPhase;
use super::state::{SimulationState, TimelineEntry};
use crate::agent::{AgentPerformance, ExerciseAgent, Team};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cyber_range::team::{AttackBroker, AttackStatistics, DefenseBroker, DefenseStatistics};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration_seconds: f64,
    pub phases_completed: Vec<SimulationPhase>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamPerformance {
    pub red_team_agents: BTreeMap<String, AgentPerformance>,
    pub blue_team_agents: BTreeMap<String, AgentPerformance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Scoring {
    pub red_team_score: u64,
    pub blue_team_score: u64,
    pub winner: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetSummary {
    pub total: usize,
    pub compromised: usize,
    pub protected: usize,
    pub compromised_assets: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionEffectiveness {
    pub attacks_detected: usize,
    pub total_attacks: usize,
    pub detection_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamBrokers {
    pub attack: AttackStatistics,
    pub defense: DefenseStatistics,
}

/// Final exercise report, written once per run
#[derive(Debug, Clone, Serialize)]
pub struct ExerciseReport {
    pub simulation_id: Uuid,
    pub scenario_name: String,
    pub execution_summary: ExecutionSummary,
    pub agent_performance: TeamPerformance,
    pub attack_timeline: Vec<TimelineEntry>,
    pub defense_timeline: Vec<TimelineEntry>,
    pub scoring: Scoring,
    pub mitre_techniques: BTreeSet<String>,
    pub critical_assets: AssetSummary,
    pub detection_effectiveness: DetectionEffectiveness,
    pub team_brokers: TeamBrokers,
}

impl ExerciseReport {
    pub fn build(
        state: &SimulationState,
        agents: &[ExerciseAgent],
        attack: &AttackBroker,
        defense: &DefenseBroker,
        end_time: DateTime<Utc>,
    ) -> Self {
        let mut performance = TeamPerformance {
            red_team_agents: BTreeMap::new(),
            blue_team_agents: BTreeMap::new(),
        };
        for agent in agents {
            let team = match agent.team() {
                Team::Red => &mut performance.red_team_agents,
                Team::Blue => &mut performance.blue_team_agents,
            };
            team.insert(agent.id().to_string(), agent.performance());
        }

        let duration = end_time - state.started_at;
        let total = state.critical_assets.len();
        let compromised = state.compromised_assets.len();

        Self {
            simulation_id: state.simulation_id,
            scenario_name: state.scenario_name.clone(),
            execution_summary: ExecutionSummary {
                start_time: state.started_at,
                end_time,
                total_duration_seconds: duration.num_milliseconds().max(0) as f64 / 1000.0,
                phases_completed: state
                    .phase_history
                    .iter()
                    .copied()
                    .filter(|p| !p.is_terminal())
                    .collect(),
            },
            agent_performance: performance,
            attack_timeline: state.attack_timeline.clone(),
            defense_timeline: state.defense_timeline.clone(),
            scoring: Scoring {
                red_team_score: state.red_score,
                blue_team_score: state.blue_score,
                winner: state.winner(),
            },
            mitre_techniques: state.mitre_techniques_used.clone(),
            critical_assets: AssetSummary {
                total,
                compromised,
                protected: total.saturating_sub(compromised),
                compromised_assets: state.compromised_assets.clone(),
            },
            detection_effectiveness: DetectionEffectiveness {
                attacks_detected: state.detected_attacks,
                total_attacks: state.attack_timeline.len(),
                detection_rate: state.detection_rate(),
            },
            team_brokers: TeamBrokers {
                attack: attack.statistics(),
                defense: defense.statistics(),
            },
        }
    }

    /// `simulation_report_<scenario>_<YYYYmmdd_HHMMSS>.json`
    pub fn file_name(&self) -> String {
        format!(
            "simulation_report_{}_{}.json",
            self.scenario_name,
            self.execution_summary.end_time.format("%Y%m%d_%H%M%S")
        )
    }

    /// Write the report as pretty JSON into `directory`, creating it if
    /// needed. Returns the path written.
    pub fn write_to(&self, directory: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(directory).with_context(|| {
            format!("Failed to create report directory {}", directory.display())
        })?;
        let path = directory.join(self.file_name());
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(path)
    }
}
