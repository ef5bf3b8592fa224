//! ReaperLoop - periodic lease expiry.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use super::Ticker;
use crate::queue::TaskQueue;

/// Runs `sweep_expired` on a fixed interval, reclaiming tasks from crashed or
/// hung workers. Sweep errors are logged and the next tick tries again.
pub struct ReaperLoop {
    queue: TaskQueue,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(queue: TaskQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Returns the number of tasks reclaimed over the loop's lifetime.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> u64 {
        if !self.queue.config().expires() {
            info!("Queue never expires leases; reaper idle until shutdown");
        }
        let mut reclaimed = 0;
        let mut ticker = Ticker::new(self.interval, shutdown);
        while ticker.tick().await {
            match self.queue.sweep_expired(false).await {
                Ok(n) => reclaimed += n,
                Err(e) => error!(error = %e, "Expiry sweep failed"),
            }
        }
        reclaimed
    }
}
