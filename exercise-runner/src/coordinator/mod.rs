//! Exercise coordinator.
//!
//! Owns the three brokers, the agents and the [`SimulationState`]. The run
//! loop is a fixed-rate ticker: each tick drains agent responses from the
//! inbox, dispatches the current phase's commands, advances the phase once
//! its duration has elapsed, rescores and publishes a [`StatusSnapshot`].
//! Only the loop mutates state; dashboards read snapshots from a `watch`
//! channel.

pub mod phase;
pub mod report;
pub mod state;

#[cfg(test)]
mod tests;

pub use phase::{Dispatch, PhaseContext, SimulationPhase, PHASE_ORDER};
pub use report::ExerciseReport;
pub use state::{SimulationState, StatusSnapshot, TimelineEntry};

use crate::agent::{AgentRole, ExerciseAgent, Team, INITIALIZE};
use crate::executor::{build_executor, TaskExecutor};
use crate::narrative::NarrativeLog;
use crate::settings::RunnerConfig;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use cyber_range::broker::{Broker, BrokerSettings};
use cyber_range::client::{BrokerClient, ChannelHandler, ClientSettings};
use cyber_range::config::BrokerRole;
use cyber_range::message::{into_payload, Message, MessageType, BROADCAST, COORDINATOR_ID};
use cyber_range::scenario::ScenarioCatalog;
use cyber_range::team::{
    AlertDraft, AlertStatus, AttackBroker, DefenseBroker, DefensePosture, Severity,
    SideStateError, TargetStatus,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::{pending, Future};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COORDINATOR_TYPE: &str = "coordinator";
const SUMMARY_LIMIT: usize = 200;

/// Rules seeded on the defense broker, one per detection capability
pub const DETECTION_RULES: [&str; 4] = [
    "anomaly_detection",
    "ioc_generation",
    "alert_correlation",
    "detection_rule",
];

/// How a run loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Reached the terminal phase
    Completed,
    /// Hit the global deadline first
    TimedOut,
    /// Shutdown future resolved
    Interrupted,
    /// A loop iteration failed
    Failed(String),
}

struct InFlight {
    message_id: Uuid,
    sent_at: Instant,
}

/// State that exists once a scenario is loaded
struct ActiveRun {
    state: SimulationState,
    narrative: NarrativeLog,
}

pub struct Coordinator {
    config: RunnerConfig,
    executor: Arc<dyn TaskExecutor>,
    main: Arc<Broker>,
    attack: AttackBroker,
    defense: DefenseBroker,
    /// Coordinator sessions, one per broker
    links: Vec<(BrokerRole, BrokerClient)>,
    agents: Vec<ExerciseAgent>,
    run: Option<ActiveRun>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox: mpsc::UnboundedReceiver<Message>,
    /// Last unanswered command per role
    in_flight: HashMap<AgentRole, InFlight>,
    status_tx: watch::Sender<Option<StatusSnapshot>>,
}

impl Coordinator {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let executor = build_executor(&config.executor)?;
        Ok(Self::with_executor(config, executor))
    }

    pub fn with_executor(config: RunnerConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        let main = Arc::new(Broker::new(BrokerSettings::from_config(
            &config.range,
            BrokerRole::Main,
        )));
        let attack = AttackBroker::new(BrokerSettings::from_config(&config.range, BrokerRole::Red));
        let defense =
            DefenseBroker::new(BrokerSettings::from_config(&config.range, BrokerRole::Blue));
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(None);

        Self {
            config,
            executor,
            main,
            attack,
            defense,
            links: Vec::new(),
            agents: Vec::new(),
            run: None,
            inbox_tx,
            inbox,
            in_flight: HashMap::new(),
            status_tx,
        }
    }

    /// Load `scenario_name`, start the brokers, connect the coordinator and
    /// every agent on the roster, and enter the initialization phase.
    pub async fn initialize(&mut self, scenario_name: &str) -> Result<()> {
        if self.run.is_some() {
            bail!("Coordinator is already initialized");
        }

        let catalog = ScenarioCatalog::builtin()?;
        let scenario = catalog.get(scenario_name).ok_or_else(|| {
            anyhow!(
                "Unknown scenario '{}' (available: {})",
                scenario_name,
                catalog.names().join(", ")
            )
        })?;
        for warning in scenario.validate().warnings {
            warn!(scenario = %scenario.name, warning = %warning, "Scenario warning");
        }

        self.main
            .start()
            .await
            .context("Failed to start main broker")?;
        self.attack
            .start()
            .await
            .context("Failed to start red team broker")?;
        self.defense
            .start()
            .await
            .context("Failed to start blue team broker")?;

        let rule_config = json!({ "defensive_measures": scenario.defensive_measures });
        for rule in DETECTION_RULES {
            if let Err(e) = self.defense.add_detection_rule(rule, rule_config.clone()) {
                debug!(rule_id = rule, error = %e, "Detection rule not seeded");
            }
        }

        let brokers = [
            (BrokerRole::Main, &self.main),
            (BrokerRole::Red, self.attack.broker()),
            (BrokerRole::Blue, self.defense.broker()),
        ];
        for (role, broker) in brokers {
            let url = broker
                .url()
                .with_context(|| format!("{} broker has no address", role.as_str()))?;
            let link = BrokerClient::new(ClientSettings::new(
                url,
                COORDINATOR_ID,
                COORDINATOR_TYPE,
                &self.config.range.client,
            ));
            for message_type in [MessageType::Response, MessageType::Error] {
                link.register_handler(
                    message_type,
                    Arc::new(ChannelHandler::from_sender(self.inbox_tx.clone())),
                );
            }
            link.start()
                .await
                .with_context(|| format!("Coordinator failed to join {} broker", role.as_str()))?;
            self.links.push((role, link));
        }

        let mut state = SimulationState::new(scenario);
        for role in self.config.exercise.roster() {
            let broker = match role.team() {
                Team::Red => self.attack.broker(),
                Team::Blue => self.defense.broker(),
            };
            let url = broker
                .url()
                .with_context(|| format!("{} broker has no address", role.team().as_str()))?;
            let agent = ExerciseAgent::new(
                role,
                &url,
                &self.config.range.client,
                Arc::clone(&self.executor),
                self.config.exercise.task_timeout(),
            );
            agent
                .start()
                .await
                .with_context(|| format!("Failed to start agent {}", agent.id()))?;
            state.agents.insert(agent.id().to_string(), role);
            self.agents.push(agent);
        }

        state.restart_phase_clock();
        let narrative = NarrativeLog::new(scenario.name.as_str());
        narrative.scenario_event(
            "simulation_initialized",
            &format!("Exercise initialized for {}", scenario.display_name),
            json!({
                "simulation_id": state.simulation_id,
                "sector": scenario.sector,
                "agents": state.agents,
                "critical_assets": scenario.asset_names(),
            }),
        );
        info!(
            simulation_id = %state.simulation_id,
            scenario = %scenario.name,
            agents = self.agents.len(),
            "Coordinator initialized"
        );

        self.run = Some(ActiveRun { state, narrative });
        self.publish();
        Ok(())
    }

    /// Run until the terminal phase or `total` elapses.
    pub async fn run(&mut self, total: Duration) -> Result<RunOutcome> {
        self.run_until(total, pending()).await
    }

    /// Like [`Coordinator::run`], also ending when `shutdown` resolves.
    ///
    /// A failing iteration ends the loop with [`RunOutcome::Failed`]; the
    /// caller still finalizes and cleans up.
    pub async fn run_until<F>(&mut self, total: Duration, shutdown: F) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        if self.run.is_none() {
            bail!("Coordinator is not initialized");
        }

        // `None` when the timeout is beyond what the clock can represent
        let deadline = Instant::now().checked_add(total);
        let mut ticker = interval(self.config.exercise.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(timeout_seconds = total.as_secs(), "Exercise run started");
        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => break RunOutcome::Interrupted,
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                break RunOutcome::TimedOut;
            }
            if let Err(e) = self.step() {
                let reason = format!("{:#}", e);
                error!(error = %reason, "Exercise loop failed");
                break RunOutcome::Failed(reason);
            }
            if self.phase().is_some_and(|p| p.is_terminal()) {
                break RunOutcome::Completed;
            }
        };
        info!(outcome = ?outcome, "Exercise run ended");
        Ok(outcome)
    }

    /// One loop iteration.
    pub fn step(&mut self) -> Result<()> {
        self.drain_inbox();

        let (phase, elapsed) = match &self.run {
            Some(run) => (run.state.phase, run.state.phase_elapsed()),
            None => bail!("Coordinator is not initialized"),
        };
        if phase.is_terminal() {
            return Ok(());
        }

        self.dispatch_phase(phase)?;
        if elapsed >= self.config.exercise.phase_durations.get(phase) {
            self.advance();
        }

        if let Some(run) = self.run.as_mut() {
            run.state.update_scores();
        }
        self.publish();
        Ok(())
    }

    fn dispatch_phase(&mut self, phase: SimulationPhase) -> Result<()> {
        let Some(run) = self.run.as_ref() else {
            return Ok(());
        };
        let roster = self.config.exercise.roster();
        let ctx = PhaseContext {
            simulation_id: run.state.simulation_id,
            scenario_name: &run.state.scenario_name,
            critical_assets: &run.state.critical_assets,
            roster: &roster,
        };
        let dispatches = phase::dispatches_for(phase, &ctx);
        let resend_after = self
            .config
            .exercise
            .task_timeout()
            .saturating_add(self.config.range.client.command_timeout());

        for dispatch in dispatches {
            if let Some(flight) = self.in_flight.get(&dispatch.role) {
                if flight.sent_at.elapsed() < resend_after {
                    continue;
                }
                warn!(
                    role = dispatch.role.as_str(),
                    message_id = %flight.message_id,
                    "Command unanswered, dispatching again"
                );
            }

            let Some(agent) = self.agents.iter().find(|a| a.role() == dispatch.role) else {
                continue;
            };
            let team = dispatch.role.team();
            let link = self
                .link(team.broker_role())
                .with_context(|| format!("Coordinator is not connected to the {} broker", team.as_str()))?;

            let command_type = dispatch.command_type().to_string();
            let message =
                Message::command(COORDINATOR_ID, agent.id(), dispatch.command).expecting_response();
            let message_id = message.id();
            link.send_message(message)
                .with_context(|| format!("Failed to dispatch {} to {}", command_type, agent.id()))?;
            debug!(
                agent_id = %agent.id(),
                command_type = %command_type,
                message_id = %message_id,
                "Command dispatched"
            );

            self.in_flight.insert(
                dispatch.role,
                InFlight {
                    message_id,
                    sent_at: Instant::now(),
                },
            );
        }
        Ok(())
    }

    fn advance(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let Some((from, to)) = run.state.advance_phase() else {
            return;
        };

        if to.is_attack_phase() {
            self.attack.update_attack_phase(to.as_str());
        }
        match to {
            SimulationPhase::Execution => self.defense.update_defense_posture(DefensePosture::Active),
            SimulationPhase::DefenseResponse => {
                self.defense.update_defense_posture(DefensePosture::Containment)
            }
            SimulationPhase::PostIncident => {
                self.defense.update_defense_posture(DefensePosture::Recovery)
            }
            _ => {}
        }

        let status = into_payload(json!({
            "phase": to,
            "previous_phase": from,
            "simulation_id": run.state.simulation_id,
        }));
        for (role, link) in &self.links {
            let message = Message::new(COORDINATOR_ID, BROADCAST, MessageType::Status, status.clone());
            if let Err(e) = link.send_message(message) {
                warn!(broker = role.as_str(), error = %e, "Failed to broadcast phase change");
            }
        }

        run.narrative.scenario_event(
            "phase_transition",
            &format!("Exercise moved from {} to {}", from.as_str(), to.as_str()),
            json!({
                "from": from,
                "to": to,
                "red_team_score": run.state.red_score,
                "blue_team_score": run.state.blue_score,
            }),
        );
        info!(from = from.as_str(), to = to.as_str(), "Phase transition");
    }

    fn drain_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message.message_type() {
                MessageType::Response => self.apply_response(message),
                MessageType::Error => {
                    let original = message
                        .content_str("original_message_id")
                        .and_then(|id| Uuid::parse_str(id).ok());
                    if let Some(id) = original {
                        self.clear_in_flight(id);
                    }
                    warn!(
                        receiver_id = message.content_str("receiver_id").unwrap_or(""),
                        error = message.content_str("error").unwrap_or("unknown"),
                        "Dispatch rejected by broker"
                    );
                }
                other => debug!(message_type = other.as_str(), "Ignoring inbound message"),
            }
        }
    }

    fn clear_in_flight(&mut self, message_id: Uuid) {
        self.in_flight.retain(|_, flight| flight.message_id != message_id);
    }

    /// Fold one agent response into the state and the team brokers.
    fn apply_response(&mut self, message: Message) {
        self.clear_in_flight(message.id());
        let Some(run) = self.run.as_mut() else {
            return;
        };

        let agent_id = message.sender_id();
        let Some(role) = run.state.agents.get(agent_id).copied() else {
            debug!(agent_id = %agent_id, "Response from unknown agent");
            return;
        };
        let command_type = message.content_str("command_type").unwrap_or("");
        let success = message
            .content()
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !success {
            warn!(
                agent_id = %agent_id,
                command_type = %command_type,
                error = message.content_str("error").unwrap_or("unknown"),
                "Command failed"
            );
            return;
        }
        if command_type == INITIALIZE {
            info!(agent_id = %agent_id, "Agent ready");
            return;
        }

        let team = role.team();
        let phase = run.state.phase;
        let technique = message.content_str(team.technique_key()).map(str::to_string);
        let target = message.content_str("target").map(str::to_string);
        let summary = truncate(message.content_str("result").unwrap_or(""), SUMMARY_LIMIT);
        let entry = TimelineEntry {
            timestamp: Utc::now(),
            phase,
            agent_id: agent_id.to_string(),
            role,
            command_type: command_type.to_string(),
            technique: technique.clone(),
            target: target.clone(),
            summary: summary.clone(),
        };
        let details = json!({
            "command_type": command_type,
            "phase": phase,
            "target": target,
        });
        let description = format!("{} completed {}", role.as_str(), command_type);
        let technique = technique.as_deref().unwrap_or("unknown");

        match team {
            Team::Red => {
                if let Some(target) = &target {
                    let info = json!({ "discovered_by": agent_id, "command_type": command_type });
                    match self.attack.add_target(target, info) {
                        Ok(()) | Err(SideStateError::AlreadyExists { .. }) => {}
                        Err(e) => debug!(target_id = %target, error = %e, "Target not added"),
                    }
                    if let Err(e) = self.attack.update_target_status(target, TargetStatus::Engaged) {
                        debug!(target_id = %target, error = %e, "Target status unchanged");
                    }
                }
                run.state.record_attack(entry);
                run.narrative
                    .attack_event(agent_id, technique, &description, details);
            }
            Team::Blue => {
                run.state.record_defense(entry);
                match role {
                    AgentRole::Detection => {
                        let matched = run.state.record_detection();
                        self.defense.create_alert(AlertDraft {
                            alert_type: command_type.to_string(),
                            severity: Severity::High,
                            description: summary.clone(),
                            source_agent: agent_id.to_string(),
                            details: json!({ "phase": phase, "matched_attack": matched }),
                        });
                        if let Err(e) = self.defense.trigger_detection_rule(command_type) {
                            debug!(rule_id = %command_type, error = %e, "No rule to trigger");
                        }
                    }
                    AgentRole::Response => {
                        self.defense.add_mitigation_action(
                            command_type,
                            &summary,
                            agent_id,
                            target.as_deref(),
                        );
                        for alert in self.defense.active_alerts() {
                            let next = match alert.status {
                                AlertStatus::Open => AlertStatus::Investigating,
                                _ => AlertStatus::Resolved,
                            };
                            if let Err(e) = self.defense.update_alert_status(&alert.alert_id, next) {
                                debug!(alert_id = %alert.alert_id, error = %e, "Alert not advanced");
                            }
                        }
                    }
                    _ => {}
                }
                run.narrative
                    .defense_event(agent_id, technique, &description, details);
            }
        }
    }

    /// Mark the run complete and write the report. Returns the report path.
    /// Fails on a second call.
    pub fn finalize(&mut self) -> Result<PathBuf> {
        self.drain_inbox();
        let run = self
            .run
            .as_mut()
            .context("Coordinator is not initialized")?;
        if !run.state.complete() {
            bail!("Exercise has already been finalized");
        }
        run.state.update_scores();

        let report = ExerciseReport::build(
            &run.state,
            &self.agents,
            &self.attack,
            &self.defense,
            Utc::now(),
        );
        run.narrative.scenario_event(
            "simulation_completed",
            &format!("Exercise complete, {} wins", report.scoring.winner),
            json!({
                "red_team_score": report.scoring.red_team_score,
                "blue_team_score": report.scoring.blue_team_score,
                "attack_events": report.attack_timeline.len(),
                "defense_events": report.defense_timeline.len(),
                "detection_rate": report.detection_effectiveness.detection_rate,
            }),
        );
        info!(
            simulation_id = %report.simulation_id,
            red_team_score = report.scoring.red_team_score,
            blue_team_score = report.scoring.blue_team_score,
            winner = report.scoring.winner,
            "Exercise finalized"
        );

        let path = report.write_to(&self.config.report.directory)?;
        info!(path = %path.display(), "Report written");
        self.publish();
        Ok(path)
    }

    /// Disconnect every client and stop every broker. Safe at any point.
    pub async fn cleanup(&self) {
        for (_, link) in &self.links {
            link.stop().await;
        }
        for agent in &self.agents {
            agent.stop().await;
        }
        self.attack.stop();
        self.defense.stop();
        self.main.stop();
        info!("Coordinator cleaned up");
    }

    fn publish(&self) {
        let Some(run) = &self.run else {
            return;
        };
        let snapshot = run.state.snapshot();
        self.status_tx.send_if_modified(|current| {
            if current.as_ref() == Some(&snapshot) {
                return false;
            }
            *current = Some(snapshot);
            true
        });
    }

    fn link(&self, role: BrokerRole) -> Option<&BrokerClient> {
        self.links
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, link)| link)
    }

    pub fn state(&self) -> Option<&SimulationState> {
        self.run.as_ref().map(|run| &run.state)
    }

    pub fn phase(&self) -> Option<SimulationPhase> {
        self.state().map(|state| state.phase)
    }

    /// Receiver for status snapshots; `None` until initialized.
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusSnapshot>> {
        self.status_tx.subscribe()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn main_broker(&self) -> &Arc<Broker> {
        &self.main
    }

    pub fn attack_broker(&self) -> &AttackBroker {
        &self.attack
    }

    pub fn defense_broker(&self) -> &DefenseBroker {
        &self.defense
    }

    pub fn agents(&self) -> &[ExerciseAgent] {
        &self.agents
    }

    pub fn pending_dispatches(&self) -> usize {
        self.in_flight.len()
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
