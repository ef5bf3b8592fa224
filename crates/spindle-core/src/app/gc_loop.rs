//! GcLoop - periodic discard sweep.

use std::time::Duration;

use tokio::sync::watch;
use tracing::error;

use super::Ticker;
use crate::queue::TaskQueue;

/// Runs `sweep_discards` on a fixed interval. Under the `keep` strategy each
/// tick only logs how many exhausted tasks are being retained.
pub struct GcLoop {
    queue: TaskQueue,
    interval: Duration,
}

impl GcLoop {
    pub fn new(queue: TaskQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Returns the number of tasks deleted over the loop's lifetime.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> u64 {
        let mut deleted = 0;
        let mut ticker = Ticker::new(self.interval, shutdown);
        while ticker.tick().await {
            match self.queue.sweep_discards().await {
                Ok(n) => deleted += n,
                Err(e) => error!(error = %e, "Discard sweep failed"),
            }
        }
        deleted
    }
}
