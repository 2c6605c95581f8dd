use super::phase::SimulationPhase;
use crate::agent::AgentRole;
use chrono::{DateTime, Utc};
use cyber_range::scenario::{CriticalAsset, Scenario};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Points per timeline entry
pub const POINTS_PER_EVENT: u64 = 10;

/// One successful agent action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: SimulationPhase,
    pub agent_id: String,
    pub role: AgentRole,
    pub command_type: String,
    /// MITRE technique (red) or defensive capability (blue)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technique: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub summary: String,
}

/// Everything the coordinator knows about a run.
///
/// Timelines only grow. `complete` flips to true once, after which the
/// state is only read.
#[derive(Debug, Clone)]
pub struct SimulationState {
    pub simulation_id: Uuid,
    pub scenario_name: String,
    pub phase: SimulationPhase,
    pub started_at: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
    phase_clock: Instant,
    /// agent id → role of every agent started for this run
    pub agents: BTreeMap<String, AgentRole>,
    pub red_score: u64,
    pub blue_score: u64,
    pub attack_timeline: Vec<TimelineEntry>,
    pub defense_timeline: Vec<TimelineEntry>,
    pub critical_assets: BTreeMap<String, CriticalAsset>,
    pub compromised_assets: BTreeSet<String>,
    pub mitre_techniques_used: BTreeSet<String>,
    /// Attacks matched by a detection, never more than the attack count
    pub detected_attacks: usize,
    /// Every phase entered, in order
    pub phase_history: Vec<SimulationPhase>,
    pub complete: bool,
}

impl SimulationState {
    pub fn new(scenario: &Scenario) -> Self {
        let now = Utc::now();
        Self {
            simulation_id: Uuid::new_v4(),
            scenario_name: scenario.name.clone(),
            phase: SimulationPhase::Initialization,
            started_at: now,
            phase_started_at: now,
            phase_clock: Instant::now(),
            agents: BTreeMap::new(),
            red_score: 0,
            blue_score: 0,
            attack_timeline: Vec::new(),
            defense_timeline: Vec::new(),
            critical_assets: scenario.critical_assets.clone(),
            compromised_assets: BTreeSet::new(),
            mitre_techniques_used: BTreeSet::new(),
            detected_attacks: 0,
            phase_history: vec![SimulationPhase::Initialization],
            complete: false,
        }
    }

    /// Restart the clock of the current phase.
    pub fn restart_phase_clock(&mut self) {
        self.phase_started_at = Utc::now();
        self.phase_clock = Instant::now();
    }

    pub fn phase_elapsed(&self) -> Duration {
        self.phase_clock.elapsed()
    }

    /// Move to the next phase in table order. Returns `(from, to)`, or
    /// `None` when already completed.
    pub fn advance_phase(&mut self) -> Option<(SimulationPhase, SimulationPhase)> {
        let from = self.phase;
        let to = from.next()?;
        self.phase = to;
        self.phase_history.push(to);
        self.restart_phase_clock();
        Some((from, to))
    }

    pub fn record_attack(&mut self, entry: TimelineEntry) {
        if let Some(technique) = &entry.technique {
            self.mitre_techniques_used.insert(technique.clone());
        }
        if let Some(target) = &entry.target {
            if self.critical_assets.contains_key(target) {
                self.compromised_assets.insert(target.clone());
            }
        }
        self.attack_timeline.push(entry);
    }

    pub fn record_defense(&mut self, entry: TimelineEntry) {
        self.defense_timeline.push(entry);
    }

    /// Count a detection against the oldest undetected attack. Returns
    /// false when every attack so far is already detected.
    pub fn record_detection(&mut self) -> bool {
        if self.detected_attacks < self.attack_timeline.len() {
            self.detected_attacks += 1;
            true
        } else {
            false
        }
    }

    pub fn update_scores(&mut self) {
        self.red_score = POINTS_PER_EVENT * self.attack_timeline.len() as u64;
        self.blue_score = POINTS_PER_EVENT * self.defense_timeline.len() as u64;
    }

    /// `red_team` only on a strictly higher red score.
    pub fn winner(&self) -> &'static str {
        if self.red_score > self.blue_score {
            "red_team"
        } else {
            "blue_team"
        }
    }

    pub fn detection_rate(&self) -> f64 {
        self.detected_attacks as f64 / self.attack_timeline.len().max(1) as f64
    }

    /// Mark the run complete and enter the terminal phase. Returns false
    /// if it already was complete.
    pub fn complete(&mut self) -> bool {
        if self.complete {
            return false;
        }
        self.complete = true;
        if self.phase != SimulationPhase::Completed {
            self.phase = SimulationPhase::Completed;
            self.phase_history.push(SimulationPhase::Completed);
            self.restart_phase_clock();
        }
        true
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            simulation_id: self.simulation_id,
            scenario_name: self.scenario_name.clone(),
            phase: self.phase,
            phase_started_at: self.phase_started_at,
            agents_active: self.agents.len(),
            red_score: self.red_score,
            blue_score: self.blue_score,
            attack_events: self.attack_timeline.len(),
            defense_events: self.defense_timeline.len(),
            compromised_assets: self.compromised_assets.len(),
            complete: self.complete,
        }
    }
}

/// Read-only view of a run for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub simulation_id: Uuid,
    pub scenario_name: String,
    pub phase: SimulationPhase,
    pub phase_started_at: DateTime<Utc>,
    pub agents_active: usize,
    pub red_score: u64,
    pub blue_score: u64,
    pub attack_events: usize,
    pub defense_events: usize,
    pub compromised_assets: usize,
    pub complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyber_range::scenario::ScenarioCatalog;

    fn state() -> SimulationState {
        let catalog = ScenarioCatalog::builtin().unwrap();
        SimulationState::new(catalog.get("soci_energy_grid").unwrap())
    }

    fn entry(role: AgentRole, technique: Option<&str>, target: Option<&str>) -> TimelineEntry {
        TimelineEntry {
            timestamp: Utc::now(),
            phase: SimulationPhase::Execution,
            agent_id: format!("{}_agent_00000001", role.as_str()),
            role,
            command_type: "test".to_string(),
            technique: technique.map(str::to_string),
            target: target.map(str::to_string),
            summary: String::new(),
        }
    }

    #[test]
    fn test_advance_walks_the_table_once() {
        let mut state = state();
        let mut transitions = 0;
        while let Some((from, to)) = state.advance_phase() {
            assert!(to > from);
            transitions += 1;
        }
        assert_eq!(transitions, 9);
        assert_eq!(state.phase, SimulationPhase::Completed);
        assert_eq!(state.phase_history.len(), 10);
        assert!(state.advance_phase().is_none());

        // Completing after reaching the terminal phase adds nothing
        assert!(state.complete());
        assert_eq!(state.phase_history.len(), 10);
        assert!(!state.complete());
    }

    #[test]
    fn test_complete_mid_run_jumps_to_terminal() {
        let mut state = state();
        state.advance_phase();
        assert!(state.complete());
        assert_eq!(
            state.phase_history,
            vec![
                SimulationPhase::Initialization,
                SimulationPhase::Reconnaissance,
                SimulationPhase::Completed
            ]
        );
    }

    #[test]
    fn test_attack_records_technique_and_compromise() {
        let mut state = state();
        state.record_attack(entry(AgentRole::Exploitation, Some("T1203"), Some("employee_portal")));
        state.record_attack(entry(AgentRole::LateralMovement, Some("T1547"), Some("domain_controller")));

        assert_eq!(state.attack_timeline.len(), 2);
        assert!(state.mitre_techniques_used.contains("T1203"));
        // Only scenario assets count as compromised
        assert_eq!(
            state.compromised_assets.iter().collect::<Vec<_>>(),
            vec!["employee_portal"]
        );
    }

    #[test]
    fn test_scores_and_winner() {
        let mut state = state();
        state.update_scores();
        assert_eq!(state.winner(), "blue_team");

        state.record_attack(entry(AgentRole::Recon, Some("T1592"), None));
        state.update_scores();
        assert_eq!(state.red_score, 10);
        assert_eq!(state.blue_score, 0);
        assert_eq!(state.winner(), "red_team");

        state.record_defense(entry(AgentRole::Detection, Some("detect"), None));
        state.update_scores();
        assert_eq!(state.red_score, state.blue_score);
        assert_eq!(state.winner(), "blue_team");
    }

    #[test]
    fn test_detections_never_exceed_attacks() {
        let mut state = state();
        assert!(!state.record_detection());
        assert_eq!(state.detection_rate(), 0.0);

        state.record_attack(entry(AgentRole::Recon, Some("T1592"), None));
        assert!(state.record_detection());
        assert!(!state.record_detection());
        assert_eq!(state.detected_attacks, 1);
        assert_eq!(state.detection_rate(), 1.0);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let mut state = state();
        state
            .agents
            .insert("recon_agent_00000001".to_string(), AgentRole::Recon);
        state.record_attack(entry(AgentRole::Recon, Some("T1592"), Some("scada_system")));
        state.update_scores();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.scenario_name, "soci_energy_grid");
        assert_eq!(snapshot.agents_active, 1);
        assert_eq!(snapshot.red_score, 10);
        assert_eq!(snapshot.attack_events, 1);
        assert_eq!(snapshot.compromised_assets, 1);
        assert!(!snapshot.complete);
    }
}
