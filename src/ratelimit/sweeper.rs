//! Background reclamation of idle counter keys.
//!
//! The sweep runs on its own interval, independent of request volume, so a
//! quiet service still releases memory and a busy one never pays for a
//! sweep inline.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::clock::Clock;
use super::counter::SlidingWindowCounter;

/// Periodic cleanup of idle admission records.
pub struct Sweeper {
    counter: Arc<SlidingWindowCounter>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    idle_retention: Duration,
}

impl Sweeper {
    /// Create a sweeper. Prefer [`super::RateLimiter::sweeper`], which
    /// shares the limiter's counter and clock.
    pub fn new(
        counter: Arc<SlidingWindowCounter>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        idle_retention: Duration,
    ) -> Self {
        Self {
            counter,
            clock,
            interval,
            idle_retention,
        }
    }

    /// Run one pass, returning the number of keys removed.
    pub fn sweep_once(&self) -> usize {
        let removed = self.counter.sweep(self.clock.now(), self.idle_retention);
        debug!(
            removed = removed,
            remaining = self.counter.len(),
            "Rate limit sweep completed"
        );
        removed
    }

    /// Run passes every `interval` on the tokio runtime until the returned
    /// handle is shut down or dropped.
    pub fn spawn(self) -> SweeperHandle {
        info!(
            interval = ?self.interval,
            idle_retention = ?self.idle_retention,
            "Starting rate limit sweeper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; there is nothing to sweep yet.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.sweep_once();
            }
        });

        SweeperHandle { task }
    }
}

/// Handle to a running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper.
    pub fn shutdown(self) {
        self.task.abort();
        debug!("Rate limit sweeper stopped");
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
