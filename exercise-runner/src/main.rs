use anyhow::{bail, Context, Result};
use clap::Parser;
use cyber_range::scenario::ScenarioCatalog;
use exercise_runner::coordinator::{Coordinator, RunOutcome, StatusSnapshot};
use exercise_runner::narrative;
use exercise_runner::settings::{load_runner_config, RunnerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run a red/blue cyber exercise against a built-in scenario.
#[derive(Debug, Parser)]
#[command(name = "exercise-runner", version)]
struct Cli {
    /// Scenario to run (see --list-scenarios)
    #[arg(long)]
    scenario: Option<String>,

    /// Print a status line whenever the exercise state changes
    #[arg(long, conflicts_with = "headless")]
    dashboard: bool,

    /// Run without status output
    #[arg(long)]
    headless: bool,

    /// Global run timeout in minutes (overrides the config file)
    #[arg(long)]
    timeout: Option<u64>,

    /// List the built-in scenarios and exit
    #[arg(long)]
    list_scenarios: bool,

    /// Validate the configuration and scenario, then exit
    #[arg(long)]
    validate_config: bool,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `exercise_runner=trace`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = format!("exercise_runner=info,cyber_range=info,{}=info", narrative::TARGET);
    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let catalog = ScenarioCatalog::builtin()?;

    if cli.list_scenarios {
        for scenario in catalog.scenarios() {
            println!(
                "{:<22} {:<14} {}",
                scenario.name, scenario.sector, scenario.display_name
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = load_runner_config(cli.config.as_deref())?;
    if let Some(minutes) = cli.timeout {
        config.exercise.timeout_minutes = minutes;
    }
    check_config(&config)?;

    if cli.validate_config {
        if let Some(name) = &cli.scenario {
            let scenario = catalog
                .get(name)
                .with_context(|| format!("Unknown scenario '{}'", name))?;
            let validation = scenario.validate();
            for warning in &validation.warnings {
                warn!(scenario = %name, warning = %warning, "Scenario warning");
            }
            if !validation.is_valid() {
                bail!(
                    "scenario '{}' is invalid: {}",
                    name,
                    validation.errors.join("; ")
                );
            }
        }
        println!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    let scenario = cli
        .scenario
        .context("--scenario is required (see --list-scenarios)")?;
    if catalog.get(&scenario).is_none() {
        bail!(
            "Unknown scenario '{}' (available: {})",
            scenario,
            catalog.names().join(", ")
        );
    }
    if !cli.dashboard && !cli.headless {
        bail!("choose a mode: --dashboard or --headless");
    }

    let mut coordinator = Coordinator::new(config)?;
    let dashboard = cli
        .dashboard
        .then(|| tokio::spawn(dashboard(coordinator.subscribe())));

    let result = exercise(&mut coordinator, &scenario).await;
    coordinator.cleanup().await;
    if let Some(task) = dashboard {
        task.abort();
    }
    result
}

/// Initialize, run and finalize one exercise. Cleanup is the caller's job.
async fn exercise(coordinator: &mut Coordinator, scenario: &str) -> Result<ExitCode> {
    coordinator.initialize(scenario).await?;

    let timeout = coordinator.config().exercise.timeout();
    let outcome = coordinator.run_until(timeout, shutdown_signal()).await?;

    let report = coordinator.finalize()?;
    println!("Report written to {}", report.display());

    match outcome {
        RunOutcome::Failed(reason) => {
            error!(reason = %reason, "Exercise ended on an error");
            Ok(ExitCode::FAILURE)
        }
        _ => Ok(ExitCode::SUCCESS),
    }
}

fn check_config(config: &RunnerConfig) -> Result<()> {
    let problems = config.validate();
    if problems.is_empty() {
        return Ok(());
    }
    for problem in &problems {
        error!(problem = %problem, "Invalid configuration");
    }
    bail!(
        "configuration has {} problem(s): {}",
        problems.len(),
        problems.join("; ")
    );
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, ending exercise"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

async fn dashboard(mut status: watch::Receiver<Option<StatusSnapshot>>) {
    while status.changed().await.is_ok() {
        let line = status.borrow_and_update().as_ref().map(status_line);
        if let Some(line) = line {
            println!("{}", line);
        }
    }
}

fn status_line(snapshot: &StatusSnapshot) -> String {
    let elapsed = (chrono::Utc::now() - snapshot.phase_started_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    format!(
        "[{}] phase={} ({}s) agents={} red={} blue={} attacks={} defenses={} compromised={}{}",
        snapshot.scenario_name,
        snapshot.phase.as_str(),
        elapsed.as_secs(),
        snapshot.agents_active,
        snapshot.red_score,
        snapshot.blue_score,
        snapshot.attack_events,
        snapshot.defense_events,
        snapshot.compromised_assets,
        if snapshot.complete { " complete" } else { "" }
    )
}
