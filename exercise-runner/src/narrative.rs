//! Narrative log sink.
//!
//! Exercise milestones are emitted as `tracing` events on the `narrative`
//! target, so they can be filtered or routed separately from operational
//! logs (`RUST_LOG=narrative=info`). Logging never fails.

use serde_json::Value;
use tracing::info;

pub const TARGET: &str = "narrative";

#[derive(Debug, Clone)]
pub struct NarrativeLog {
    scenario: String,
}

impl NarrativeLog {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn scenario_event(&self, event_type: &str, description: &str, details: Value) {
        info!(
            target: "narrative",
            scenario = %self.scenario,
            event_type = %event_type,
            description = %description,
            details = %details,
            "scenario event"
        );
    }

    pub fn attack_event(&self, agent_id: &str, technique: &str, description: &str, details: Value) {
        info!(
            target: "narrative",
            scenario = %self.scenario,
            event_type = "attack",
            agent_id = %agent_id,
            mitre_technique = %technique,
            description = %description,
            details = %details,
            "attack event"
        );
    }

    pub fn defense_event(
        &self,
        agent_id: &str,
        capability: &str,
        description: &str,
        details: Value,
    ) {
        info!(
            target: "narrative",
            scenario = %self.scenario,
            event_type = "defense",
            agent_id = %agent_id,
            defensive_capability = %capability,
            description = %description,
            details = %details,
            "defense event"
        );
    }
}
