use super::cycle::BackupCycle;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::sleep;
use tracing::{info, warn};

fn shutdown_requested(shutdown: &AtomicUsize) -> bool {
    shutdown.load(Ordering::Relaxed) > 0
}

/// Runs a cycle immediately, then once per `interval`, until `shutdown` is
/// raised. A running cycle is never interrupted. Returns how many cycles
/// ran and how many of them failed.
pub async fn run_scheduler(
    cycle: &mut BackupCycle,
    interval: Duration,
    shutdown: Arc<AtomicUsize>,
) -> (u64, u64) {
    info!("Starting backup scheduler, interval: {} seconds", interval.as_secs());

    let mut runs = 0u64;
    let mut failures = 0u64;
    let mut first_run = true;

    loop {
        if shutdown_requested(&shutdown) {
            info!("Scheduler shutdown requested");
            break;
        }

        if !first_run {
            let next_run = chrono::Utc::now()
                + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
            info!("Next backup at {}", next_run.format("%Y-%m-%d %H:%M:%S UTC"));

            select! {
                _ = sleep(interval) => {}
                _ = async {
                    while !shutdown_requested(&shutdown) {
                        sleep(Duration::from_millis(100)).await;
                    }
                } => {
                    info!("Scheduler shutdown requested during wait");
                    break;
                }
            }
        }
        first_run = false;

        let outcome = cycle.run().await;
        runs += 1;
        if !outcome.is_success() {
            failures += 1;
            warn!("Cycle {} failed; next attempt at the regular interval", runs);
        }
    }

    info!("Scheduler stopped after {} cycle(s), {} failed", runs, failures);
    (runs, failures)
}
