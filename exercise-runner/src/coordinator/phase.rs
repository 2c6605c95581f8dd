//! Exercise phases and the phase → action table.
//!
//! Phase order and per-phase dispatches are data: [`PHASE_ORDER`] drives
//! advancement and [`PHASE_ACTIONS`] drives dispatch.

use crate::agent::{AgentRole, INITIALIZE};
use cyber_range::message::{into_payload, Payload};
use cyber_range::scenario::CriticalAsset;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationPhase {
    Initialization,
    Reconnaissance,
    InitialAccess,
    Execution,
    Persistence,
    DefenseResponse,
    LateralMovement,
    Exfiltration,
    PostIncident,
    Completed,
}

pub const PHASE_ORDER: [SimulationPhase; 10] = [
    SimulationPhase::Initialization,
    SimulationPhase::Reconnaissance,
    SimulationPhase::InitialAccess,
    SimulationPhase::Execution,
    SimulationPhase::Persistence,
    SimulationPhase::DefenseResponse,
    SimulationPhase::LateralMovement,
    SimulationPhase::Exfiltration,
    SimulationPhase::PostIncident,
    SimulationPhase::Completed,
];

impl SimulationPhase {
    /// Every phase except the terminal one
    pub const ACTIVE: [SimulationPhase; 9] = [
        SimulationPhase::Initialization,
        SimulationPhase::Reconnaissance,
        SimulationPhase::InitialAccess,
        SimulationPhase::Execution,
        SimulationPhase::Persistence,
        SimulationPhase::DefenseResponse,
        SimulationPhase::LateralMovement,
        SimulationPhase::Exfiltration,
        SimulationPhase::PostIncident,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationPhase::Initialization => "initialization",
            SimulationPhase::Reconnaissance => "reconnaissance",
            SimulationPhase::InitialAccess => "initial_access",
            SimulationPhase::Execution => "execution",
            SimulationPhase::Persistence => "persistence",
            SimulationPhase::DefenseResponse => "defense_response",
            SimulationPhase::LateralMovement => "lateral_movement",
            SimulationPhase::Exfiltration => "exfiltration",
            SimulationPhase::PostIncident => "post_incident",
            SimulationPhase::Completed => "completed",
        }
    }

    pub fn index(&self) -> usize {
        PHASE_ORDER
            .iter()
            .position(|p| p == self)
            .unwrap_or(PHASE_ORDER.len() - 1)
    }

    /// Next phase in table order; `None` once completed.
    pub fn next(&self) -> Option<SimulationPhase> {
        PHASE_ORDER.get(self.index() + 1).copied()
    }

    pub fn is_terminal(&self) -> bool {
        *self == SimulationPhase::Completed
    }

    /// Phases that move the attack broker's phase label
    pub fn is_attack_phase(&self) -> bool {
        matches!(
            self,
            SimulationPhase::Reconnaissance
                | SimulationPhase::InitialAccess
                | SimulationPhase::Execution
                | SimulationPhase::Persistence
                | SimulationPhase::LateralMovement
                | SimulationPhase::Exfiltration
        )
    }
}

/// What a phase action needs to know about the exercise
pub struct PhaseContext<'a> {
    pub simulation_id: Uuid,
    pub scenario_name: &'a str,
    pub critical_assets: &'a BTreeMap<String, CriticalAsset>,
    pub roster: &'a [AgentRole],
}

/// One command for the agent holding `role`
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub role: AgentRole,
    pub command: Payload,
}

impl Dispatch {
    fn new(role: AgentRole, command: serde_json::Value) -> Self {
        Self {
            role,
            command: into_payload(command),
        }
    }

    pub fn command_type(&self) -> &str {
        self.command
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

pub type PhaseAction = fn(&PhaseContext<'_>) -> Vec<Dispatch>;

pub const PHASE_ACTIONS: [(SimulationPhase, PhaseAction); 9] = [
    (SimulationPhase::Initialization, initialization),
    (SimulationPhase::Reconnaissance, reconnaissance),
    (SimulationPhase::InitialAccess, initial_access),
    (SimulationPhase::Execution, execution),
    (SimulationPhase::Persistence, persistence),
    (SimulationPhase::DefenseResponse, defense_response),
    (SimulationPhase::LateralMovement, lateral_movement),
    (SimulationPhase::Exfiltration, exfiltration),
    (SimulationPhase::PostIncident, post_incident),
];

/// Dispatches for `phase`, skipping roles missing from the roster.
pub fn dispatches_for(phase: SimulationPhase, ctx: &PhaseContext<'_>) -> Vec<Dispatch> {
    PHASE_ACTIONS
        .iter()
        .find(|(p, _)| *p == phase)
        .map(|(_, action)| action(ctx))
        .unwrap_or_default()
        .into_iter()
        .filter(|d| ctx.roster.contains(&d.role))
        .collect()
}

fn initialization(ctx: &PhaseContext<'_>) -> Vec<Dispatch> {
    ctx.roster
        .iter()
        .map(|role| {
            Dispatch::new(
                *role,
                json!({
                    "type": INITIALIZE,
                    "scenario": ctx.scenario_name,
                    "critical_assets": ctx.critical_assets,
                    "simulation_id": ctx.simulation_id,
                }),
            )
        })
        .collect()
}

fn reconnaissance(ctx: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![
        Dispatch::new(
            AgentRole::Recon,
            json!({
                "type": "osint_gathering",
                "target": ctx.scenario_name,
                "information_type": "organization",
            }),
        ),
        Dispatch::new(
            AgentRole::Detection,
            json!({
                "type": "anomaly_detection",
                "log_data": "simulated_network_logs",
                "baseline_behavior": "normal_operations",
                "analysis_type": "statistical",
            }),
        ),
    ]
}

fn initial_access(_: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![
        Dispatch::new(
            AgentRole::SocialEngineering,
            json!({
                "type": "phishing_campaign",
                "target_role": "system_administrator",
                "scenario_type": "credential_theft",
                "urgency_level": "high",
            }),
        ),
        Dispatch::new(
            AgentRole::Response,
            json!({
                "type": "incident_triage",
                "incident_data": "simulated_phishing_alerts",
                "severity_factors": "credential_compromise_risk",
                "business_impact": "critical",
            }),
        ),
    ]
}

fn execution(_: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![
        Dispatch::new(
            AgentRole::Exploitation,
            json!({
                "type": "vulnerability_chain",
                "vulnerabilities": "CVE-2023-1234, CVE-2023-5678",
                "target_system": "employee_portal",
                "chain_complexity": "moderate",
            }),
        ),
        Dispatch::new(
            AgentRole::Detection,
            json!({
                "type": "alert_correlation",
                "alerts": "simulated_exploitation_alerts",
                "correlation_method": "temporal",
            }),
        ),
    ]
}

fn persistence(_: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![Dispatch::new(
        AgentRole::LateralMovement,
        json!({
            "type": "persistence_mechanism",
            "mechanism_type": "scheduled_task",
            "target_system": "domain_controller",
            "stealth_level": "high",
        }),
    )]
}

fn defense_response(_: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![
        Dispatch::new(
            AgentRole::Response,
            json!({
                "type": "containment_strategy",
                "threat_vector": "malware_execution",
                "affected_systems": "employee_portal, domain_controller",
                "containment_level": "segmented",
            }),
        ),
        Dispatch::new(
            AgentRole::ThreatIntel,
            json!({
                "type": "ttp_mapping",
                "attack_data": "simulated_attack_techniques",
                "mapping_granularity": "technique",
                "framework_version": "v13.1",
            }),
        ),
    ]
}

fn lateral_movement(_: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![Dispatch::new(
        AgentRole::LateralMovement,
        json!({
            "type": "network_traversal",
            "starting_point": "employee_portal",
            "target_destination": "scada_system",
            "network_constraints": "network_segmentation",
        }),
    )]
}

fn exfiltration(_: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![Dispatch::new(
        AgentRole::Exploitation,
        json!({
            "type": "control_bypass",
            "security_control": "data_loss_prevention",
            "bypass_method": "encryption_steganography",
            "target_environment": "internal_network",
        }),
    )]
}

fn post_incident(_: &PhaseContext<'_>) -> Vec<Dispatch> {
    vec![
        Dispatch::new(
            AgentRole::Response,
            json!({
                "type": "remediation_procedure",
                "incident_type": "advanced_persistent_threat",
                "compromised_assets": "employee_portal, domain_controller",
                "recovery_priority": "critical",
            }),
        ),
        Dispatch::new(
            AgentRole::ThreatIntel,
            json!({
                "type": "intelligence_report",
                "intelligence_data": "simulated_full_attack_chain",
                "report_type": "strategic",
                "audience": "executive_management",
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::commands;

    fn context<'a>(
        roster: &'a [AgentRole],
        assets: &'a BTreeMap<String, CriticalAsset>,
    ) -> PhaseContext<'a> {
        PhaseContext {
            simulation_id: Uuid::nil(),
            scenario_name: "soci_energy_grid",
            critical_assets: assets,
            roster,
        }
    }

    #[test]
    fn test_order_is_linear_and_terminal() {
        let mut phase = SimulationPhase::Initialization;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            phase = next;
            visited.push(phase);
        }
        assert_eq!(visited, PHASE_ORDER.to_vec());
        assert!(phase.is_terminal());
        assert_eq!(SimulationPhase::Completed.next(), None);
    }

    #[test]
    fn test_every_active_phase_has_an_action() {
        for (i, phase) in SimulationPhase::ACTIVE.iter().enumerate() {
            assert_eq!(PHASE_ACTIONS[i].0, *phase);
        }
    }

    #[test]
    fn test_dispatches_match_phase_table() {
        let assets = BTreeMap::new();
        let roster = AgentRole::ALL;
        let ctx = context(&roster, &assets);

        let summary = |phase| -> Vec<(AgentRole, String)> {
            dispatches_for(phase, &ctx)
                .into_iter()
                .map(|d| (d.role, d.command_type().to_string()))
                .collect()
        };

        assert_eq!(
            summary(SimulationPhase::Reconnaissance),
            vec![
                (AgentRole::Recon, "osint_gathering".to_string()),
                (AgentRole::Detection, "anomaly_detection".to_string()),
            ]
        );
        assert_eq!(
            summary(SimulationPhase::Persistence),
            vec![(AgentRole::LateralMovement, "persistence_mechanism".to_string())]
        );
        assert_eq!(
            summary(SimulationPhase::PostIncident),
            vec![
                (AgentRole::Response, "remediation_procedure".to_string()),
                (AgentRole::ThreatIntel, "intelligence_report".to_string()),
            ]
        );
        assert!(summary(SimulationPhase::Completed).is_empty());
    }

    #[test]
    fn test_initialization_reaches_whole_roster() {
        let assets = BTreeMap::new();
        let roster = [AgentRole::Recon, AgentRole::Response];
        let dispatches = dispatches_for(SimulationPhase::Initialization, &context(&roster, &assets));

        assert_eq!(dispatches.len(), 2);
        assert!(dispatches.iter().all(|d| d.command_type() == INITIALIZE));
        assert_eq!(dispatches[0].command["scenario"], json!("soci_energy_grid"));
    }

    #[test]
    fn test_absent_roles_are_skipped() {
        let assets = BTreeMap::new();
        let roster = [AgentRole::Recon, AgentRole::Exploitation, AgentRole::Response];
        let ctx = context(&roster, &assets);

        let execution = dispatches_for(SimulationPhase::Execution, &ctx);
        assert_eq!(execution.len(), 1);
        assert_eq!(execution[0].role, AgentRole::Exploitation);

        assert!(dispatches_for(SimulationPhase::LateralMovement, &ctx).is_empty());
    }

    #[test]
    fn test_every_dispatched_command_is_understood() {
        let assets = BTreeMap::new();
        let roster = AgentRole::ALL;
        let ctx = context(&roster, &assets);
        for phase in SimulationPhase::ACTIVE {
            for dispatch in dispatches_for(phase, &ctx) {
                if dispatch.command_type() == INITIALIZE {
                    continue;
                }
                assert!(
                    commands::find(dispatch.role, dispatch.command_type()).is_some(),
                    "{:?} cannot handle {}",
                    dispatch.role,
                    dispatch.command_type()
                );
            }
        }
    }
}
