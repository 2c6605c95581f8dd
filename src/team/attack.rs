use super::{tail, LogEntry, SideStateError};
use crate::broker::{Broker, BrokerSettings, BrokerStatistics};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

const INITIAL_PHASE: &str = "reconnaissance";
const RECENT_TIMELINE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Identified,
    Engaged,
    Abandoned,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Identified => "identified",
            TargetStatus::Engaged => "engaged",
            TargetStatus::Abandoned => "abandoned",
        }
    }

    /// `identified → engaged | abandoned`; both outcomes are terminal.
    pub fn can_become(&self, next: TargetStatus) -> bool {
        matches!(
            (self, next),
            (TargetStatus::Identified, TargetStatus::Engaged)
                | (TargetStatus::Identified, TargetStatus::Abandoned)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub target_id: String,
    pub info: Value,
    pub status: TargetStatus,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AttackEvent {
    PhaseChange {
        from: String,
        to: String,
    },
    TargetIdentified {
        target_id: String,
    },
    TargetStatusChange {
        target_id: String,
        from: TargetStatus,
        to: TargetStatus,
    },
}

#[derive(Debug, Default)]
struct AttackState {
    phase: String,
    targets: HashMap<String, Target>,
    timeline: Vec<LogEntry<AttackEvent>>,
}

/// Attacker-facing statistics: broker stats plus attack bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct AttackStatistics {
    #[serde(flatten)]
    pub broker: BrokerStatistics,
    pub attack_phase: String,
    pub active_targets: usize,
    pub engaged_targets: usize,
    pub timeline_length: usize,
    pub recent_timeline: Vec<LogEntry<AttackEvent>>,
}

/// Broker for the attacker population, with phase and target tracking
pub struct AttackBroker {
    broker: Arc<Broker>,
    state: Mutex<AttackState>,
}

impl AttackBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            broker: Arc::new(Broker::new(settings)),
            state: Mutex::new(AttackState {
                phase: INITIAL_PHASE.to_string(),
                ..AttackState::default()
            }),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        self.broker.start().await
    }

    pub fn stop(&self) {
        self.broker.stop();
    }

    fn state(&self) -> MutexGuard<'_, AttackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attack_phase(&self) -> String {
        self.state().phase.clone()
    }

    /// Set the attack phase label. Setting the current label again is a no-op.
    pub fn update_attack_phase(&self, phase: &str) {
        let mut state = self.state();
        if state.phase == phase {
            return;
        }
        let from = std::mem::replace(&mut state.phase, phase.to_string());
        info!(from = %from, to = %phase, "Attack phase changed");
        state.timeline.push(LogEntry::now(AttackEvent::PhaseChange {
            from,
            to: phase.to_string(),
        }));
    }

    pub fn add_target(&self, target_id: &str, info: Value) -> Result<(), SideStateError> {
        let mut state = self.state();
        if state.targets.contains_key(target_id) {
            return Err(SideStateError::AlreadyExists {
                kind: "target",
                id: target_id.to_string(),
            });
        }

        let now = Utc::now();
        state.targets.insert(
            target_id.to_string(),
            Target {
                target_id: target_id.to_string(),
                info,
                status: TargetStatus::Identified,
                discovered_at: now,
                updated_at: now,
            },
        );
        state.timeline.push(LogEntry::now(AttackEvent::TargetIdentified {
            target_id: target_id.to_string(),
        }));
        info!(target_id = %target_id, "Target identified");
        Ok(())
    }

    pub fn update_target_status(
        &self,
        target_id: &str,
        status: TargetStatus,
    ) -> Result<(), SideStateError> {
        let mut state = self.state();
        let target = state
            .targets
            .get_mut(target_id)
            .ok_or_else(|| SideStateError::NotFound {
                kind: "target",
                id: target_id.to_string(),
            })?;

        let from = target.status;
        if !from.can_become(status) {
            return Err(SideStateError::InvalidTransition {
                kind: "target",
                id: target_id.to_string(),
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        target.status = status;
        target.updated_at = Utc::now();
        state.timeline.push(LogEntry::now(AttackEvent::TargetStatusChange {
            target_id: target_id.to_string(),
            from,
            to: status,
        }));
        Ok(())
    }

    pub fn target(&self, target_id: &str) -> Option<Target> {
        self.state().targets.get(target_id).cloned()
    }

    pub fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self.state().targets.values().cloned().collect();
        targets.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at));
        targets
    }

    pub fn timeline(&self) -> Vec<LogEntry<AttackEvent>> {
        self.state().timeline.clone()
    }

    pub fn statistics(&self) -> AttackStatistics {
        let broker = self.broker.get_statistics();
        let state = self.state();
        AttackStatistics {
            broker,
            attack_phase: state.phase.clone(),
            active_targets: state.targets.len(),
            engaged_targets: state
                .targets
                .values()
                .filter(|t| t.status == TargetStatus::Engaged)
                .count(),
            timeline_length: state.timeline.len(),
            recent_timeline: tail(&state.timeline, RECENT_TIMELINE),
        }
    }
}
