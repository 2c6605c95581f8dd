use anyhow::{Context, Result};
use cyber_range::broker::{Broker, BrokerSettings};
use cyber_range::config::{self, BrokerRole};
use cyber_range::team::{AttackBroker, DefenseBroker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Run the main, red and blue brokers until Ctrl-C.
///
/// Optional first argument: path to a TOML config file.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cyber_range=info".into()),
        )
        .init();

    info!("Cyber range brokers starting...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::load_config(config_path.as_deref())?;

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(problem = %problem, "Invalid configuration");
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }

    let main_broker = Arc::new(Broker::new(BrokerSettings::from_config(
        &config,
        BrokerRole::Main,
    )));
    let red = AttackBroker::new(BrokerSettings::from_config(&config, BrokerRole::Red));
    let blue = DefenseBroker::new(BrokerSettings::from_config(&config, BrokerRole::Blue));

    let main_addr = main_broker
        .start()
        .await
        .context("Failed to start main broker")?;
    let red_addr = red.start().await.context("Failed to start red broker")?;
    let blue_addr = blue.start().await.context("Failed to start blue broker")?;

    info!(
        main = %main_addr,
        red = %red_addr,
        blue = %blue_addr,
        "Brokers listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down brokers");
    blue.stop();
    red.stop();
    main_broker.stop();

    Ok(())
}
