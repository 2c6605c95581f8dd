use super::{tail, LogEntry, SideStateError};
use crate::broker::{Broker, BrokerSettings, BrokerStatistics};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

const RECENT_INCIDENTS: usize = 10;
const SUMMARY_INCIDENTS: usize = 20;

/// Operational stance of the defenders. Any posture may follow any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefensePosture {
    #[default]
    Monitoring,
    Active,
    Containment,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
        }
    }

    /// `open → investigating → resolved | false_positive`
    pub fn can_become(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::Open, AlertStatus::Investigating)
                | (AlertStatus::Investigating, AlertStatus::Resolved)
                | (AlertStatus::Investigating, AlertStatus::FalsePositive)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AlertStatus::Open | AlertStatus::Investigating)
    }
}

/// Fields supplied when raising an alert
#[derive(Debug, Clone)]
pub struct AlertDraft {
    pub alert_type: String,
    pub severity: Severity,
    pub description: String,
    pub source_agent: String,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub alert_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub description: String,
    pub source_agent: String,
    pub details: Value,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRule {
    pub rule_id: String,
    pub config: Value,
    pub enabled: bool,
    pub trigger_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MitigationAction {
    pub action_id: String,
    pub action_type: String,
    pub description: String,
    pub source_agent: String,
    pub target_threat: Option<String>,
    pub performed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum IncidentEvent {
    PostureChange {
        from: DefensePosture,
        to: DefensePosture,
    },
    AlertCreated {
        alert_id: String,
        severity: Severity,
    },
    AlertStatusChange {
        alert_id: String,
        from: AlertStatus,
        to: AlertStatus,
    },
    RuleTriggered {
        rule_id: String,
        trigger_count: u64,
    },
    MitigationPerformed {
        action_id: String,
        action_type: String,
    },
}

impl IncidentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IncidentEvent::PostureChange { .. } => "posture_change",
            IncidentEvent::AlertCreated { .. } => "alert_created",
            IncidentEvent::AlertStatusChange { .. } => "alert_status_change",
            IncidentEvent::RuleTriggered { .. } => "rule_triggered",
            IncidentEvent::MitigationPerformed { .. } => "mitigation_performed",
        }
    }
}

#[derive(Debug, Default)]
struct DefenseState {
    posture: DefensePosture,
    alerts: HashMap<String, Alert>,
    rules: HashMap<String, DetectionRule>,
    mitigations: Vec<MitigationAction>,
    incidents: Vec<LogEntry<IncidentEvent>>,
}

/// Defender-facing statistics: broker stats plus defense bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct DefenseStatistics {
    #[serde(flatten)]
    pub broker: BrokerStatistics,
    pub defense_posture: DefensePosture,
    pub total_alerts: usize,
    pub active_alerts: usize,
    pub alert_counts_by_severity: BTreeMap<String, usize>,
    pub detection_rules: usize,
    pub mitigation_actions: usize,
    pub incident_log_length: usize,
    pub recent_incidents: Vec<LogEntry<IncidentEvent>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentSummary {
    pub total_incidents: usize,
    pub incident_types: BTreeMap<String, usize>,
    pub recent_incidents: Vec<LogEntry<IncidentEvent>>,
    pub active_alerts_count: usize,
    pub defense_posture: DefensePosture,
}

/// Broker for the defender population, with posture, alert, rule and
/// mitigation tracking
pub struct DefenseBroker {
    broker: Arc<Broker>,
    state: Mutex<DefenseState>,
}

impl DefenseBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            broker: Arc::new(Broker::new(settings)),
            state: Mutex::new(DefenseState::default()),
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

    fn state(&self) -> MutexGuard<'_, DefenseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn defense_posture(&self) -> DefensePosture {
        self.state().posture
    }

    pub fn update_defense_posture(&self, posture: DefensePosture) {
        let mut state = self.state();
        if state.posture == posture {
            return;
        }
        let from = std::mem::replace(&mut state.posture, posture);
        info!(from = ?from, to = ?posture, "Defense posture changed");
        state
            .incidents
            .push(LogEntry::now(IncidentEvent::PostureChange { from, to: posture }));
    }

    /// Raise a new alert in the `open` state. Returns its id.
    pub fn create_alert(&self, draft: AlertDraft) -> String {
        let alert_id = format!("alert_{}", Uuid::new_v4().simple());
        let now = Utc::now();
        let severity = draft.severity;

        let mut state = self.state();
        state.alerts.insert(
            alert_id.clone(),
            Alert {
                alert_id: alert_id.clone(),
                alert_type: draft.alert_type,
                severity,
                description: draft.description,
                source_agent: draft.source_agent,
                details: draft.details,
                status: AlertStatus::Open,
                created_at: now,
                updated_at: now,
            },
        );
        state.incidents.push(LogEntry::now(IncidentEvent::AlertCreated {
            alert_id: alert_id.clone(),
            severity,
        }));
        if severity >= Severity::High {
            warn!(alert_id = %alert_id, severity = severity.as_str(), "High severity alert raised");
        }
        alert_id
    }

    pub fn update_alert_status(
        &self,
        alert_id: &str,
        status: AlertStatus,
    ) -> Result<(), SideStateError> {
        let mut state = self.state();
        let alert = state
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| SideStateError::NotFound {
                kind: "alert",
                id: alert_id.to_string(),
            })?;

        let from = alert.status;
        if !from.can_become(status) {
            return Err(SideStateError::InvalidTransition {
                kind: "alert",
                id: alert_id.to_string(),
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        alert.status = status;
        alert.updated_at = Utc::now();
        state.incidents.push(LogEntry::now(IncidentEvent::AlertStatusChange {
            alert_id: alert_id.to_string(),
            from,
            to: status,
        }));
        Ok(())
    }

    pub fn alert(&self, alert_id: &str) -> Option<Alert> {
        self.state().alerts.get(alert_id).cloned()
    }

    /// Alerts still open or under investigation, oldest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .state()
            .alerts
            .values()
            .filter(|a| a.status.is_active())
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        alerts
    }

    pub fn add_detection_rule(&self, rule_id: &str, config: Value) -> Result<(), SideStateError> {
        let mut state = self.state();
        if state.rules.contains_key(rule_id) {
            return Err(SideStateError::AlreadyExists {
                kind: "detection rule",
                id: rule_id.to_string(),
            });
        }
        state.rules.insert(
            rule_id.to_string(),
            DetectionRule {
                rule_id: rule_id.to_string(),
                config,
                enabled: true,
                trigger_count: 0,
                created_at: Utc::now(),
                last_triggered: None,
            },
        );
        Ok(())
    }

    /// Count one trigger of `rule_id`. Returns the new trigger count.
    pub fn trigger_detection_rule(&self, rule_id: &str) -> Result<u64, SideStateError> {
        let mut state = self.state();
        let rule = state
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| SideStateError::NotFound {
                kind: "detection rule",
                id: rule_id.to_string(),
            })?;

        rule.trigger_count += 1;
        rule.last_triggered = Some(Utc::now());
        let trigger_count = rule.trigger_count;
        state.incidents.push(LogEntry::now(IncidentEvent::RuleTriggered {
            rule_id: rule_id.to_string(),
            trigger_count,
        }));
        Ok(trigger_count)
    }

    pub fn detection_rules(&self) -> Vec<DetectionRule> {
        let mut rules: Vec<DetectionRule> = self.state().rules.values().cloned().collect();
        rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        rules
    }

    /// Record a completed mitigation. Returns its id.
    pub fn add_mitigation_action(
        &self,
        action_type: &str,
        description: &str,
        source_agent: &str,
        target_threat: Option<&str>,
    ) -> String {
        let action_id = format!("mitigation_{}", Uuid::new_v4().simple());
        let mut state = self.state();
        state.mitigations.push(MitigationAction {
            action_id: action_id.clone(),
            action_type: action_type.to_string(),
            description: description.to_string(),
            source_agent: source_agent.to_string(),
            target_threat: target_threat.map(str::to_string),
            performed_at: Utc::now(),
        });
        state
            .incidents
            .push(LogEntry::now(IncidentEvent::MitigationPerformed {
                action_id: action_id.clone(),
                action_type: action_type.to_string(),
            }));
        action_id
    }

    pub fn mitigation_actions(&self) -> Vec<MitigationAction> {
        self.state().mitigations.clone()
    }

    pub fn incident_log(&self) -> Vec<LogEntry<IncidentEvent>> {
        self.state().incidents.clone()
    }

    pub fn incident_summary(&self) -> IncidentSummary {
        let state = self.state();
        let mut incident_types = BTreeMap::new();
        for entry in &state.incidents {
            *incident_types
                .entry(entry.event.kind().to_string())
                .or_insert(0) += 1;
        }

        IncidentSummary {
            total_incidents: state.incidents.len(),
            incident_types,
            recent_incidents: tail(&state.incidents, SUMMARY_INCIDENTS),
            active_alerts_count: state.alerts.values().filter(|a| a.status.is_active()).count(),
            defense_posture: state.posture,
        }
    }

    pub fn statistics(&self) -> DefenseStatistics {
        let broker = self.broker.get_statistics();
        let state = self.state();

        let mut alert_counts_by_severity: BTreeMap<String, usize> = Severity::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for alert in state.alerts.values() {
            *alert_counts_by_severity
                .entry(alert.severity.as_str().to_string())
                .or_insert(0) += 1;
        }

        DefenseStatistics {
            broker,
            defense_posture: state.posture,
            total_alerts: state.alerts.len(),
            active_alerts: state.alerts.values().filter(|a| a.status.is_active()).count(),
            alert_counts_by_severity,
            detection_rules: state.rules.len(),
            mitigation_actions: state.mitigations.len(),
            incident_log_length: state.incidents.len(),
            recent_incidents: tail(&state.incidents, RECENT_INCIDENTS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn defense_broker() -> DefenseBroker {
        DefenseBroker::new(BrokerSettings {
            name: "blue".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 20,
            sweep_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(120),
        })
    }

    fn draft(severity: Severity) -> AlertDraft {
        AlertDraft {
            alert_type: "anomaly_detection".to_string(),
            severity,
            description: "Unusual login pattern".to_string(),
            source_agent: "detection_agent_1".to_string(),
            details: json!({"host": "employee_portal"}),
        }
    }

    #[test]
    fn test_posture_defaults_to_monitoring_and_accepts_any_value() {
        let broker = defense_broker();
        assert_eq!(broker.defense_posture(), DefensePosture::Monitoring);

        broker.update_defense_posture(DefensePosture::Recovery);
        broker.update_defense_posture(DefensePosture::Active);
        broker.update_defense_posture(DefensePosture::Active);

        assert_eq!(broker.defense_posture(), DefensePosture::Active);
        assert_eq!(broker.incident_log().len(), 2);
    }

    #[test]
    fn test_alert_lifecycle() {
        let broker = defense_broker();
        let id = broker.create_alert(draft(Severity::High));
        assert_eq!(broker.alert(&id).unwrap().status, AlertStatus::Open);

        // Cannot skip investigation
        assert!(matches!(
            broker.update_alert_status(&id, AlertStatus::Resolved),
            Err(SideStateError::InvalidTransition { .. })
        ));

        broker
            .update_alert_status(&id, AlertStatus::Investigating)
            .unwrap();
        broker
            .update_alert_status(&id, AlertStatus::FalsePositive)
            .unwrap();
        assert_eq!(broker.alert(&id).unwrap().status, AlertStatus::FalsePositive);

        // Terminal
        assert!(broker
            .update_alert_status(&id, AlertStatus::Investigating)
            .is_err());
        assert!(broker.active_alerts().is_empty());
    }

    #[test]
    fn test_unknown_alert_is_not_found() {
        let broker = defense_broker();
        assert_eq!(
            broker.update_alert_status("alert_missing", AlertStatus::Investigating),
            Err(SideStateError::NotFound {
                kind: "alert",
                id: "alert_missing".to_string(),
            })
        );
    }

    #[test]
    fn test_detection_rule_trigger_counts() {
        let broker = defense_broker();
        broker
            .add_detection_rule("network_segmentation", json!({"source": "scenario"}))
            .unwrap();
        assert!(broker
            .add_detection_rule("network_segmentation", json!({}))
            .is_err());

        assert_eq!(broker.trigger_detection_rule("network_segmentation"), Ok(1));
        assert_eq!(broker.trigger_detection_rule("network_segmentation"), Ok(2));
        assert!(broker.trigger_detection_rule("missing").is_err());

        let rules = broker.detection_rules();
        assert_eq!(rules[0].trigger_count, 2);
        assert!(rules[0].last_triggered.is_some());
    }

    #[test]
    fn test_mitigation_log() {
        let broker = defense_broker();
        let id = broker.add_mitigation_action(
            "containment_strategy",
            "Segment employee portal",
            "response_agent_1",
            Some("malware_execution"),
        );

        let actions = broker.mitigation_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_id, id);
        assert_eq!(actions[0].target_threat.as_deref(), Some("malware_execution"));
    }

    #[test]
    fn test_incident_summary_counts_types() {
        let broker = defense_broker();
        broker.update_defense_posture(DefensePosture::Active);
        let a = broker.create_alert(draft(Severity::Critical));
        broker.create_alert(draft(Severity::Low));
        broker
            .update_alert_status(&a, AlertStatus::Investigating)
            .unwrap();
        broker.add_mitigation_action("isolate", "Isolate host", "response_agent_1", None);

        let summary = broker.incident_summary();
        assert_eq!(summary.total_incidents, 5);
        assert_eq!(summary.incident_types["alert_created"], 2);
        assert_eq!(summary.incident_types["posture_change"], 1);
        assert_eq!(summary.incident_types["alert_status_change"], 1);
        assert_eq!(summary.incident_types["mitigation_performed"], 1);
        assert_eq!(summary.active_alerts_count, 2);
        assert_eq!(summary.defense_posture, DefensePosture::Active);
    }

    #[test]
    fn test_statistics_count_by_severity() {
        let broker = defense_broker();
        broker.create_alert(draft(Severity::High));
        broker.create_alert(draft(Severity::High));
        broker.create_alert(draft(Severity::Low));

        let stats = broker.statistics();
        assert_eq!(stats.total_alerts, 3);
        assert_eq!(stats.alert_counts_by_severity["high"], 2);
        assert_eq!(stats.alert_counts_by_severity["low"], 1);
        assert_eq!(stats.alert_counts_by_severity["critical"], 0);
        assert_eq!(stats.recent_incidents.len(), 3);

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["name"], "blue");
        assert_eq!(value["defense_posture"], "monitoring");
    }
}
