use super::*;
use super::state::POINTS_PER_EVENT;
use crate::executor::TaskOutcome;
use crate::settings::PhaseDurations;
use async_trait::async_trait;
use cyber_range::team::DefensePosture;
use std::path::Path;

fn test_config(report_dir: &Path) -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.range.brokers.host = "127.0.0.1".to_string();
    for role in BrokerRole::ALL {
        config.range.brokers.endpoint_mut(role).port = 0;
    }
    config.exercise.red_agents = vec![AgentRole::Recon, AgentRole::Exploitation];
    config.exercise.blue_agents = vec![AgentRole::Detection, AgentRole::Response];
    config.exercise.tick_interval_ms = 50;
    config.exercise.phase_durations = PhaseDurations::uniform(1);
    config.report.directory = report_dir.to_path_buf();
    config
}

struct RefusingExecutor;

#[async_trait]
impl TaskExecutor for RefusingExecutor {
    fn name(&self) -> &str {
        "refusing"
    }

    async fn execute(&self, _task: &str, _context: Option<&Value>) -> TaskOutcome {
        TaskOutcome::failure("executor offline")
    }
}

#[tokio::test]
async fn test_unknown_scenario_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();

    let err = coordinator.initialize("soci_lunar_base").await.unwrap_err();
    assert!(err.to_string().contains("Unknown scenario 'soci_lunar_base'"));
    assert!(!coordinator.main_broker().is_running());
    assert!(coordinator.state().is_none());
}

#[tokio::test]
async fn test_run_requires_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();

    assert!(coordinator.run(Duration::from_secs(1)).await.is_err());
    assert!(coordinator.finalize().is_err());
    // Cleanup on a coordinator that never started
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_initialize_connects_everyone() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
    let status = coordinator.subscribe();
    assert!(status.borrow().is_none());

    coordinator.initialize("soci_energy_grid").await.unwrap();

    // Two agents plus the coordinator on each team broker
    assert_eq!(coordinator.attack_broker().broker().connected_count(), 3);
    assert_eq!(coordinator.defense_broker().broker().connected_count(), 3);
    assert!(coordinator.main_broker().is_connected(COORDINATOR_ID));
    assert!(coordinator
        .attack_broker()
        .broker()
        .get_agent_list()
        .iter()
        .any(|id| id.starts_with("recon_agent_")));

    let rules: Vec<String> = coordinator
        .defense_broker()
        .detection_rules()
        .into_iter()
        .map(|r| r.rule_id)
        .collect();
    assert_eq!(rules.len(), DETECTION_RULES.len());
    assert!(rules.contains(&"ioc_generation".to_string()));

    let snapshot = status.borrow().clone().unwrap();
    assert_eq!(snapshot.phase, SimulationPhase::Initialization);
    assert_eq!(snapshot.agents_active, 4);
    assert_eq!(snapshot.scenario_name, "soci_energy_grid");

    assert!(coordinator.initialize("soci_energy_grid").await.is_err());
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_full_run_walks_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = Coordinator::new(test_config(dir.path())).unwrap();
    coordinator.initialize("soci_energy_grid").await.unwrap();

    let outcome = coordinator.run(Duration::from_secs(30)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let state = coordinator.state().unwrap();
    assert_eq!(state.phase_history, PHASE_ORDER.to_vec());
    assert!(!state.attack_timeline.is_empty());
    assert!(!state.defense_timeline.is_empty());
    assert!(state.mitre_techniques_used.contains("T1592"));
    assert!(state.compromised_assets.contains("employee_portal"));
    assert!(state.detected_attacks <= state.attack_timeline.len());
    assert_eq!(
        state.red_score,
        POINTS_PER_EVENT * state.attack_timeline.len() as u64
    );

    // Team broker side effects
    assert_eq!(coordinator.attack_broker().attack_phase(), "exfiltration");
    assert_eq!(
        coordinator.defense_broker().defense_posture(),
        DefensePosture::Recovery
    );
    assert!(coordinator
        .defense_broker()
        .detection_rules()
        .iter()
        .any(|r| r.rule_id == "anomaly_detection" && r.trigger_count > 0));
    assert!(!coordinator.defense_broker().mitigation_actions().is_empty());
    assert!(coordinator.attack_broker().target("employee_portal").is_some());

    let path = coordinator.finalize().unwrap();
    assert!(path.starts_with(dir.path()));
    let report: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let winner = report["scoring"]["winner"].as_str().unwrap();
    assert!(winner == "red_team" || winner == "blue_team");
    assert_eq!(
        report["execution_summary"]["phases_completed"]
            .as_array()
            .unwrap()
            .len(),
        9
    );
    assert_eq!(
        report["agent_performance"]["red_team_agents"]
            .as_object()
            .unwrap()
            .len(),
        2
    );
    assert!(report["detection_effectiveness"]["detection_rate"].as_f64().unwrap() <= 1.0);

    // A run is finalized once
    assert!(coordinator.finalize().is_err());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

    coordinator.cleanup().await;
    assert!(!coordinator.attack_broker().broker().is_running());
}

#[tokio::test]
async fn test_deadline_ends_run_mid_phase() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.exercise.phase_durations = PhaseDurations::default();
    let mut coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize("soci_water_system").await.unwrap();

    let outcome = coordinator.run(Duration::from_millis(300)).await.unwrap();
    assert_eq!(outcome, RunOutcome::TimedOut);
    assert_eq!(coordinator.phase(), Some(SimulationPhase::Initialization));

    coordinator.finalize().unwrap();
    let state = coordinator.state().unwrap();
    assert!(state.complete);
    assert_eq!(
        state.phase_history,
        vec![SimulationPhase::Initialization, SimulationPhase::Completed]
    );
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_shutdown_interrupts_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.exercise.phase_durations = PhaseDurations::default();
    let mut coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize("soci_telco_network").await.unwrap();

    let outcome = coordinator
        .run_until(
            Duration::from_secs(60),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Interrupted);
    assert!(coordinator.finalize().is_ok());
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_unbounded_timeout_runs_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.exercise.phase_durations = PhaseDurations::default();
    let mut coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize("soci_energy_grid").await.unwrap();

    let outcome = coordinator
        .run_until(Duration::MAX, tokio::time::sleep(Duration::from_millis(150)))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Interrupted);
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_failed_commands_leave_timelines_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator =
        Coordinator::with_executor(test_config(dir.path()), Arc::new(RefusingExecutor));
    coordinator.initialize("soci_energy_grid").await.unwrap();

    // Initialization plus part of reconnaissance
    let outcome = coordinator.run(Duration::from_millis(2500)).await.unwrap();
    assert_eq!(outcome, RunOutcome::TimedOut);

    let state = coordinator.state().unwrap();
    assert!(state.phase_history.contains(&SimulationPhase::Reconnaissance));
    assert!(state.attack_timeline.is_empty());
    assert!(state.defense_timeline.is_empty());
    assert_eq!(state.red_score, 0);

    let recon = coordinator
        .agents()
        .iter()
        .find(|a| a.role() == AgentRole::Recon)
        .unwrap()
        .performance();
    assert!(recon.commands_failed > 0);
    // Initialize acknowledgements never reach the executor
    assert!(recon.commands_succeeded > 0);

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_rejected_dispatch_clears_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.exercise.phase_durations = PhaseDurations::default();
    let mut coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize("soci_energy_grid").await.unwrap();

    // Agents leave; their brokers no longer know them
    for agent in coordinator.agents() {
        agent.stop().await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    coordinator.step().unwrap();
    assert_eq!(coordinator.pending_dispatches(), 4);

    tokio::time::sleep(Duration::from_millis(300)).await;
    coordinator.drain_inbox();
    assert_eq!(coordinator.pending_dispatches(), 0);

    coordinator.cleanup().await;
}

#[test]
fn test_truncate_respects_char_boundaries() {
    assert_eq!(truncate("short", 200), "short");
    assert_eq!(truncate("ééééé", 3), "ééé");
    assert_eq!(truncate("", 3), "");
}
