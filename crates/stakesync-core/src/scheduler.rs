//! Background sync triggers.
//!
//! Drives an engine from a periodic timer and a connectivity signal until
//! shut down. Triggers that arrive while a cycle is running are dropped by
//! the engine's in-flight guard.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::{SyncEngine, SyncTrigger};
use crate::server::SyncServer;

// Placeholder period when the timer is disabled; that branch never fires.
const IDLE_PERIOD: Duration = Duration::from_secs(3_600);

/// Run sync triggers until `shutdown` is cancelled.
///
/// Periodic ticks are skipped while offline. A `false -> true` transition on
/// `connectivity` starts a cycle immediately. Shutdown also cancels a cycle
/// that is in flight.
pub async fn run_scheduler<S: SyncServer>(
    engine: &SyncEngine<S>,
    mut connectivity: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    let periodic = engine.config().sync_interval;
    let mut ticker = tokio::time::interval(periodic.unwrap_or(IDLE_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    let mut watching = true;
    tracing::info!(
        "Sync scheduler started (interval: {})",
        periodic.map_or_else(|| "manual".to_string(), |period| format!("{}s", period.as_secs()))
    );

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick(), if periodic.is_some() => {
                if !engine.is_online() {
                    tracing::debug!("Skipping periodic sync while offline");
                    continue;
                }
                if let Err(error) = engine.sync(SyncTrigger::Periodic, &shutdown).await {
                    tracing::error!("Periodic sync failed: {}", error);
                }
            }
            changed = connectivity.changed(), if watching => {
                if changed.is_err() {
                    tracing::debug!("Connectivity source closed");
                    watching = false;
                    continue;
                }
                let online = *connectivity.borrow_and_update();
                if let Err(error) = engine.on_connectivity_changed_with(online, &shutdown).await {
                    tracing::error!("Sync after reconnect failed: {}", error);
                }
            }
        }
    }

    tracing::info!("Sync scheduler stopped");
}
