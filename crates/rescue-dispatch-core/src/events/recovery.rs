//! Periodic recovery worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::EventBus;

/// Run [`EventBus::run_recovery_scan`] every `interval` until `shutdown` flips
/// to `true` or its sender is dropped.
///
/// The first scan runs immediately, which picks up events left pending by a
/// previous process.
pub fn spawn_recovery(
    bus: Arc<EventBus>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Recovery worker started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = bus.run_recovery_scan().await {
                        error!("Recovery scan failed: {}", e);
                    }
                }
            }
        }

        info!("Recovery worker stopped");
    })
}
