//! Time sources for admission checks.
//!
//! Counters only ever compare [`Instant`]s. Wall-clock time is needed only
//! to render the epoch seconds carried in `X-RateLimit-Reset`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Current wall-clock time.
    fn wall_now(&self) -> DateTime<Utc>;

    /// Convert a monotonic instant into whole epoch seconds (floored).
    fn epoch_secs(&self, instant: Instant) -> i64 {
        let now = self.now();
        let wall = self.wall_now();
        let shifted = if instant >= now {
            chrono::Duration::from_std(instant - now).map(|d| wall + d)
        } else {
            chrono::Duration::from_std(now - instant).map(|d| wall - d)
        };
        shifted.unwrap_or(wall).timestamp()
    }
}

/// System clock backed by `Instant::now()` and `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying time, so advancing one clone is seen by
/// every holder (limiter, sweeper, test body).
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<(Instant, DateTime<Utc>)>>,
}

impl MockClock {
    /// Create a mock clock pinned to the current system time.
    pub fn new() -> Self {
        Self::starting_at(Instant::now(), Utc::now())
    }

    /// Create a mock clock at explicit monotonic and wall-clock origins.
    pub fn starting_at(instant: Instant, wall: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new((instant, wall))),
        }
    }

    /// Advance both monotonic and wall time by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        current.0 += duration;
        if let Ok(delta) = chrono::Duration::from_std(duration) {
            current.1 += delta;
        }
    }

    /// Move the monotonic clock backwards without touching wall time.
    ///
    /// Only useful for exercising counter fault handling.
    pub fn rewind(&self, duration: Duration) {
        let mut current = self.current.lock();
        if let Some(earlier) = current.0.checked_sub(duration) {
            current.0 = earlier;
        }
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.current.lock().0
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.current.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now() > t1);
    }

    #[test]
    fn test_mock_clock_advance_is_shared() {
        let clock = MockClock::new();
        let start = clock.now();
        let shared = clock.clone();

        shared.advance(Duration::from_secs(10));

        assert_eq!(clock.now(), start + Duration::from_secs(10));
    }

    #[test]
    fn test_epoch_secs_of_future_instant() {
        let wall = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = MockClock::starting_at(Instant::now(), wall);

        let reset = clock.now() + Duration::from_secs(60);
        assert_eq!(clock.epoch_secs(reset), 1_700_000_060);

        let past = clock.now() - Duration::from_millis(1500);
        assert_eq!(clock.epoch_secs(past), 1_699_999_998);
    }
}
