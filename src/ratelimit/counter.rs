//! Sliding-window admission counter.
//!
//! Each key owns an [`AdmissionRecord`]: the instants of its recently
//! admitted events, oldest first. A check evicts everything at or before
//! `now - window`, compares what is left against the limit, and appends
//! `now` on success. The window is therefore the half-open interval
//! `(now - window, now]` and slides continuously rather than resetting on
//! bucket boundaries.
//!
//! # Locking
//!
//! Records live behind a per-key [`Mutex`] stored in a sharded [`DashMap`].
//! The shard lock is only held to look up or insert a record; the
//! evict/compare/append sequence runs under the key's own mutex, so unrelated
//! clients never serialize on each other. The sweep holds one shard lock at a
//! time and skips any record that an in-flight check still references.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use super::key::RateLimitKey;

/// How far `now` may trail the newest recorded event before it is treated as
/// a broken clock rather than lock-acquisition skew between callers.
const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(1);

/// Outcome of a single counter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the event was admitted (and recorded)
    pub allowed: bool,
    /// The limit the check ran against
    pub limit: u32,
    /// Further admissions permitted in the current window
    pub remaining: u32,
    /// The window the check ran against
    pub window: Duration,
    /// Instant after which capacity is guaranteed to free up
    pub reset_time: Instant,
    /// Whole seconds until `reset_time`, rounded up (only set when denied)
    pub retry_after: Option<u64>,
}

/// Internal counter faults.
///
/// These indicate a broken invariant rather than an over-limit client. The
/// caller decides how to degrade; [`super::RateLimiter`] fails open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterFault {
    /// `now` is earlier than an event that was already recorded
    #[error("clock regressed by {behind:?} for key {key}")]
    ClockRegression { key: String, behind: Duration },

    /// The record is full but has no oldest entry to compute a reset from
    #[error("record for key {key} is over limit but empty")]
    EmptyRecord { key: String },
}

/// Time-ordered admission events for one key.
#[derive(Debug, Default)]
pub struct AdmissionRecord {
    events: VecDeque<Instant>,
}

impl AdmissionRecord {
    /// Number of events currently held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the record holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The oldest held event.
    pub fn oldest(&self) -> Option<Instant> {
        self.events.front().copied()
    }

    /// The newest held event.
    pub fn newest(&self) -> Option<Instant> {
        self.events.back().copied()
    }

    /// Drop every event at or before `cutoff`.
    ///
    /// A `None` cutoff lies before any representable instant, so nothing is
    /// evicted.
    fn evict_through(&mut self, cutoff: Option<Instant>) {
        let Some(cutoff) = cutoff else {
            return;
        };
        while let Some(&oldest) = self.events.front() {
            if oldest > cutoff {
                break;
            }
            self.events.pop_front();
        }
    }

    fn push(&mut self, at: Instant) {
        self.events.push_back(at);
    }
}

/// Concurrent map of keys to admission records.
#[derive(Debug, Default)]
pub struct SlidingWindowCounter {
    records: DashMap<RateLimitKey, Arc<Mutex<AdmissionRecord>>>,
}

impl SlidingWindowCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether one more event for `key` fits in `limit` per `window`
    /// at `now`, recording it if so.
    ///
    /// The whole evict/compare/append sequence is atomic per key. A `limit`
    /// of zero always denies.
    pub fn check(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> Result<Decision, CounterFault> {
        let record = self.record_for(key);
        let mut record = record.lock();

        // Callers sample `now` before taking the key lock, so a concurrent
        // caller may have appended a slightly later instant. Recording at
        // the newest instant keeps the record non-decreasing.
        let now = match record.newest() {
            Some(newest) if newest > now => {
                let behind = newest - now;
                if behind > CLOCK_SKEW_TOLERANCE {
                    return Err(CounterFault::ClockRegression {
                        key: key.to_string_key(),
                        behind,
                    });
                }
                newest
            }
            _ => now,
        };

        record.evict_through(now.checked_sub(window));
        let held = record.len();

        if (held as u64) < u64::from(limit) {
            record.push(now);
            let remaining = (u64::from(limit) - held as u64 - 1) as u32;
            trace!(key = %key, held = held + 1, limit = limit, "Admission recorded");
            return Ok(Decision {
                allowed: true,
                limit,
                remaining,
                window,
                reset_time: now + window,
                retry_after: None,
            });
        }

        let reset_time = if limit == 0 {
            now + window
        } else {
            match record.oldest() {
                Some(oldest) => oldest + window,
                None => {
                    return Err(CounterFault::EmptyRecord {
                        key: key.to_string_key(),
                    })
                }
            }
        };

        Ok(Decision {
            allowed: false,
            limit,
            remaining: 0,
            window,
            reset_time,
            retry_after: Some(ceil_secs(reset_time.saturating_duration_since(now))),
        })
    }

    /// Remove events older than `idle_retention` and drop keys left empty.
    ///
    /// Returns the number of keys removed. Records referenced by an
    /// in-flight check are left alone until a later pass.
    pub fn sweep(&self, now: Instant, idle_retention: Duration) -> usize {
        let cutoff = now.checked_sub(idle_retention);
        let mut removed = 0;

        // `retain` holds each shard's write lock while visiting it, so no
        // check can clone a record out of that shard mid-visit. A strong
        // count of one therefore means nobody is about to append.
        self.records.retain(|_, record| {
            if Arc::strong_count(record) > 1 {
                return true;
            }
            let mut events = record.lock();
            events.evict_through(cutoff);
            let keep = !events.is_empty();
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `key` currently has a record.
    pub fn contains(&self, key: &RateLimitKey) -> bool {
        self.records.contains_key(key)
    }

    /// Number of events held for `key`, without evicting.
    pub fn held(&self, key: &RateLimitKey) -> Option<usize> {
        let record = self.records.get(key)?.value().clone();
        let held = record.lock().len();
        Some(held)
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }

    fn record_for(&self, key: &RateLimitKey) -> Arc<Mutex<AdmissionRecord>> {
        if let Some(existing) = self.records.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.records.entry(key.clone()).or_default().value())
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn key(client: &str) -> RateLimitKey {
        RateLimitKey::endpoint("/api/contact", client)
    }

    #[test]
    fn test_counter_admits_up_to_limit() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now();
        let key = key("10.0.0.1");

        for (i, expected) in [4, 3, 2, 1, 0].into_iter().enumerate() {
            let now = start + Duration::from_secs(i as u64);
            let decision = counter.check(&key, 5, MINUTE, now).unwrap();
            assert!(decision.allowed, "request {} should be admitted", i + 1);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.reset_time, now + MINUTE);
            assert_eq!(decision.retry_after, None);
        }

        // The 6th request should be rejected
        let now = start + Duration::from_secs(10);
        let decision = counter.check(&key, 5, MINUTE, now).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_time, start + MINUTE);
        assert_eq!(decision.retry_after, Some(50));
    }

    #[test]
    fn test_denied_checks_are_not_recorded() {
        let counter = SlidingWindowCounter::new();
        let now = Instant::now();
        let key = key("10.0.0.1");

        counter.check(&key, 1, MINUTE, now).unwrap();
        for _ in 0..10 {
            assert!(!counter.check(&key, 1, MINUTE, now).unwrap().allowed);
        }

        assert_eq!(counter.held(&key), Some(1));
    }

    #[test]
    fn test_window_slides_per_event() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now();
        let key = key("10.0.0.1");

        counter.check(&key, 2, MINUTE, start).unwrap();
        counter
            .check(&key, 2, MINUTE, start + Duration::from_secs(30))
            .unwrap();
        assert!(!counter
            .check(&key, 2, MINUTE, start + Duration::from_secs(45))
            .unwrap()
            .allowed);

        // Only the first event has aged out; the one at +30s still counts.
        let decision = counter
            .check(&key, 2, MINUTE, start + Duration::from_secs(61))
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!counter
            .check(&key, 2, MINUTE, start + Duration::from_secs(62))
            .unwrap()
            .allowed);
    }

    #[test]
    fn test_event_exactly_one_window_old_is_expired() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now();
        let key = key("10.0.0.1");

        counter.check(&key, 1, MINUTE, start).unwrap();
        assert!(!counter
            .check(&key, 1, MINUTE, start + MINUTE - Duration::from_nanos(1))
            .unwrap()
            .allowed);
        assert!(counter.check(&key, 1, MINUTE, start + MINUTE).unwrap().allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now();
        let key = key("10.0.0.1");

        counter.check(&key, 1, MINUTE, start).unwrap();
        let decision = counter
            .check(&key, 1, MINUTE, start + Duration::from_millis(59_500))
            .unwrap();

        assert_eq!(decision.retry_after, Some(1));
    }

    #[test]
    fn test_zero_limit_always_denies() {
        let counter = SlidingWindowCounter::new();
        let now = Instant::now();
        let key = key("10.0.0.1");

        let decision = counter.check(&key, 0, MINUTE, now).unwrap();

        assert!(!decision.allowed);
        assert_eq!(decision.reset_time, now + MINUTE);
        assert_eq!(decision.retry_after, Some(60));
        assert_eq!(counter.held(&key), Some(0));
    }

    #[test]
    fn test_different_keys_have_separate_records() {
        let counter = SlidingWindowCounter::new();
        let now = Instant::now();

        for _ in 0..3 {
            counter.check(&key("10.0.0.1"), 3, MINUTE, now).unwrap();
        }
        assert!(!counter.check(&key("10.0.0.1"), 3, MINUTE, now).unwrap().allowed);

        let decision = counter.check(&key("10.0.0.2"), 3, MINUTE, now).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(counter.len(), 2);
    }

    #[test]
    fn test_small_clock_skew_is_absorbed() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now() + Duration::from_secs(5);
        let key = key("10.0.0.1");

        counter.check(&key, 5, MINUTE, start).unwrap();
        let decision = counter
            .check(&key, 5, MINUTE, start - Duration::from_millis(10))
            .unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.reset_time, start + MINUTE);
    }

    #[test]
    fn test_large_clock_regression_is_a_fault() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now() + Duration::from_secs(30);
        let key = key("10.0.0.1");

        counter.check(&key, 5, MINUTE, start).unwrap();
        let fault = counter
            .check(&key, 5, MINUTE, start - Duration::from_secs(10))
            .unwrap_err();

        assert!(matches!(fault, CounterFault::ClockRegression { .. }));
    }

    #[test]
    fn test_concurrent_checks_never_overadmit() {
        let counter = SlidingWindowCounter::new();
        let key = key("10.0.0.1");
        let now = Instant::now();
        let limit = 25;

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        (0..20)
                            .filter(|_| counter.check(&key, limit, MINUTE, now).unwrap().allowed)
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, limit as usize);
        assert_eq!(counter.held(&key), Some(limit as usize));
    }

    #[test]
    fn test_sweep_removes_idle_keys() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now();
        let idle = Duration::from_secs(3600);

        counter.check(&key("idle"), 5, MINUTE, start).unwrap();
        counter
            .check(&key("active"), 5, MINUTE, start + Duration::from_secs(3000))
            .unwrap();

        let removed = counter.sweep(start + Duration::from_secs(3601), idle);

        assert_eq!(removed, 1);
        assert!(!counter.contains(&key("idle")));
        assert!(counter.contains(&key("active")));
    }

    #[test]
    fn test_sweep_keeps_referenced_records() {
        let counter = SlidingWindowCounter::new();
        let start = Instant::now();
        let key = key("10.0.0.1");

        counter.check(&key, 0, MINUTE, start).unwrap();
        let in_flight = counter.record_for(&key);

        assert_eq!(counter.sweep(start, Duration::from_secs(1)), 0);
        assert!(counter.contains(&key));

        drop(in_flight);
        assert_eq!(counter.sweep(start, Duration::from_secs(1)), 1);
        assert!(counter.is_empty());
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
    }
}
