use super::Broker;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Periodically evict connections that have gone quiet.
///
/// This is the only path that reclaims handles for peers that vanished
/// without a clean close. Runs until the task is aborted by `Broker::stop`.
pub async fn run_liveness_sweep(broker: Arc<Broker>, every: Duration, stale_after: Duration) {
    let mut ticker = interval(every);

    // Skip missed ticks to prevent a burst of sweeps after a stall
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // The first tick completes immediately; nothing can be stale yet
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let evicted = broker.evict_stale(stale_after);
        if evicted.is_empty() {
            debug!(broker = %broker.name(), "Liveness sweep found no stale connections");
        } else {
            info!(
                broker = %broker.name(),
                count = evicted.len(),
                agents = ?evicted,
                "Evicted stale connections"
            );
        }
    }
}
