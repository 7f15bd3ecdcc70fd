//! Periodic timeout sweep.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Spawn a task that calls `tick` every `interval` until `shutdown` fires.
///
/// Missed ticks are skipped rather than bursted. Returns the number of
/// ticks run when the task stops.
pub fn spawn_timeout_sweeper<F>(
    interval: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<u64>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick();
                    ticks += 1;
                }
                () = shutdown.cancelled() => {
                    debug!(ticks, "timeout sweeper stopped");
                    return ticks;
                }
            }
        }
    })
}
