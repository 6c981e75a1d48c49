use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::EventBus;

/// Hourly retention sweep: terminal events and old execution logs beyond
/// their configured ages are deleted on the same cadence.
pub(crate) async fn sweep_loop(bus: Arc<EventBus>, shutdown: CancellationToken) {
    let mut tick =
        tokio::time::interval(Duration::from_secs(bus.retention.sweep_interval_secs));
    // The immediate first tick doubles as a startup sweep.
    loop {
        tokio::select! {
            _ = tick.tick() => sweep_once(&bus),
            _ = shutdown.cancelled() => {
                debug!("retention sweeper shutting down");
                break;
            }
        }
    }
}

fn sweep_once(bus: &EventBus) {
    let now = Utc::now();
    let event_cutoff = now - chrono::Duration::days(bus.retention.events_days as i64);
    let execution_cutoff = now - chrono::Duration::days(bus.retention.executions_days as i64);

    match bus.store.sweep_events(event_cutoff) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "swept terminal events"),
        Err(e) => error!("event sweep failed: {e}"),
    }
    match bus.store.sweep_executions(execution_cutoff) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "swept execution logs"),
        Err(e) => error!("execution sweep failed: {e}"),
    }
}
