//! App - `TaskQueue` 上で常駐するループ群
//!
//! - **WorkerLoop** / **WorkerGroup**: claim して `TaskHandler` に渡し、結果を report
//! - **ReaperLoop**: 期限切れ lease の定期回収
//! - **GcLoop**: discard strategy の定期適用
//!
//! どのループも `watch` の shutdown シグナルで停止します。

pub mod gc_loop;
pub mod reaper_loop;
pub mod worker_loop;

pub use self::gc_loop::GcLoop;
pub use self::reaper_loop::ReaperLoop;
pub use self::worker_loop::{HandlerError, TaskHandler, WorkerGroup, WorkerLoop, WorkerStats};

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// Fixed-rate ticks that end when shutdown is requested.
pub(crate) struct Ticker {
    interval: Interval,
    shutdown: watch::Receiver<bool>,
}

impl Ticker {
    pub(crate) fn new(period: Duration, shutdown: watch::Receiver<bool>) -> Self {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, shutdown }
    }

    /// Waits for the next tick. `false` once shutdown was requested or the
    /// sender is gone.
    pub(crate) async fn tick(&mut self) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        let alive = tokio::select! {
            _ = self.interval.tick() => true,
            changed = self.shutdown.changed() => changed.is_ok(),
        };
        alive && !*self.shutdown.borrow()
    }
}
