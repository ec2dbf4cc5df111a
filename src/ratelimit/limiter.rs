//! Request admission.
//!
//! [`RateLimiter`] ties the pieces together for one request: bypass check,
//! identity classification, policy resolution, then one counter check per
//! resolved budget in order. The first denial wins and later budgets are
//! not consulted.
//!
//! # Fail-open
//!
//! A [`CounterFault`] means the limiter itself is broken, not that the
//! client is over budget. The faulted budget is treated as passed and the
//! fault is logged at `error`. This layer is best-effort protection: a bug
//! in it must not take the service down with it.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use super::clock::Clock;
use super::counter::{CounterFault, Decision, SlidingWindowCounter};
use super::key::RateLimitKey;
use super::rules::{Policy, PolicyResolver};
use super::sweeper::Sweeper;
use crate::auth::{IdentityClassifier, IdentityTier};
use crate::config::TurnstileConfig;
use crate::error::Result;

/// Outcome of admitting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The path is exempt; no counter was touched
    Bypassed,
    /// Every budget had room
    Admitted {
        /// Tier the caller was classified into
        tier: IdentityTier,
        /// Decision of the last evaluated (global) budget, absent if that
        /// budget faulted
        governing: Option<Decision>,
    },
    /// A budget was exhausted
    Rejected {
        /// Key of the exhausted budget
        key: RateLimitKey,
        /// Policy of the exhausted budget
        policy: Policy,
        /// The denying decision
        decision: Decision,
    },
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// The admission orchestrator.
///
/// This struct is thread-safe and can be shared across request tasks.
pub struct RateLimiter {
    /// Shared with the sweeper
    counter: Arc<SlidingWindowCounter>,
    resolver: PolicyResolver,
    classifier: IdentityClassifier,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter with an empty counter.
    pub fn new(resolver: PolicyResolver, classifier: IdentityClassifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            counter: Arc::new(SlidingWindowCounter::new()),
            resolver,
            classifier,
            clock,
        }
    }

    /// Build a rate limiter from validated configuration.
    pub fn from_config(config: &TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let resolver = config.rate_limiting.validate()?;
        let classifier = IdentityClassifier::from_config(&config.auth)?;
        Ok(Self::new(resolver, classifier, clock))
    }

    /// Admit or reject one request.
    ///
    /// `authorization` is the raw `Authorization` header value and `client`
    /// the client identifier the budgets are keyed by.
    pub async fn admit(&self, path: &str, authorization: Option<&str>, client: &str) -> Admission {
        if self.resolver.is_bypassed(path) {
            trace!(path = %path, "Path bypasses rate limiting");
            return Admission::Bypassed;
        }

        let tier = self.classifier.classify(authorization).await;
        self.check_request(path, tier, client)
    }

    /// Check every budget governing a request for an already classified
    /// caller.
    pub fn check_request(&self, path: &str, tier: IdentityTier, client: &str) -> Admission {
        let resolved = self.resolver.resolve(path, tier, client);
        if resolved.is_empty() {
            return Admission::Bypassed;
        }

        let now = self.clock.now();
        let mut governing = None;

        for budget in resolved {
            match self
                .counter
                .check(&budget.key, budget.policy.limit(), budget.policy.window(), now)
            {
                Ok(decision) if decision.allowed => {
                    trace!(
                        key = %budget.key,
                        remaining = decision.remaining,
                        "Budget has room"
                    );
                    governing = Some(decision);
                }
                Ok(decision) => {
                    warn!(
                        target: "security",
                        scope = %budget.key.scope,
                        target_name = %budget.key.target,
                        client = %client,
                        limit = %budget.policy,
                        retry_after = ?decision.retry_after,
                        "Rate limit exceeded"
                    );
                    return Admission::Rejected {
                        key: budget.key,
                        policy: budget.policy,
                        decision,
                    };
                }
                Err(fault) => {
                    self.fail_open(&budget.key, &fault);
                    governing = None;
                }
            }
        }

        debug!(path = %path, tier = %tier, client = %client, "Request admitted");
        Admission::Admitted { tier, governing }
    }

    /// Render a decision's reset instant as epoch seconds.
    pub fn reset_epoch(&self, decision: &Decision) -> i64 {
        self.clock.epoch_secs(decision.reset_time)
    }

    /// Create a sweeper over this limiter's counter.
    pub fn sweeper(&self, interval: Duration, idle_retention: Duration) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.counter),
            Arc::clone(&self.clock),
            interval,
            idle_retention,
        )
    }

    /// The policy resolver.
    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.counter.len()
    }

    /// Whether `key` currently has counter state.
    pub fn is_tracked(&self, key: &RateLimitKey) -> bool {
        self.counter.contains(key)
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.counter.clear();
    }

    fn fail_open(&self, key: &RateLimitKey, fault: &CounterFault) {
        error!(
            key = %key,
            error = %fault,
            "Rate limit counter fault, admitting request"
        );
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("resolver", &self.resolver)
            .field("classifier", &self.classifier)
            .field("tracked_keys", &self.counter.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;
    use crate::ratelimit::{MockClock, PolicyRule, Scope};

    fn limiter_with(config: RateLimitingConfig) -> (RateLimiter, MockClock) {
        let clock = MockClock::new();
        let limiter = RateLimiter::new(
            PolicyResolver::from_config(&config).unwrap(),
            IdentityClassifier::anonymous(),
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    fn limiter() -> (RateLimiter, MockClock) {
        limiter_with(RateLimitingConfig::default())
    }

    fn rejected_scope(admission: &Admission) -> Option<Scope> {
        match admission {
            Admission::Rejected { key, .. } => Some(key.scope),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_creation() {
        let (limiter, _) = limiter();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_admit_records_endpoint_and_global() {
        let (limiter, _) = limiter();

        let admission = limiter.admit("/api/contact", None, "10.0.0.1").await;

        match admission {
            Admission::Admitted { tier, governing } => {
                assert_eq!(tier, IdentityTier::Default);
                let governing = governing.unwrap();
                assert_eq!(governing.limit, 100);
                assert_eq!(governing.remaining, 99);
            }
            other => panic!("expected admission, got {:?}", other),
        }
        assert!(limiter.is_tracked(&RateLimitKey::endpoint("/api/contact", "10.0.0.1")));
        assert!(limiter.is_tracked(&RateLimitKey::global("default", "10.0.0.1")));
    }

    #[tokio::test]
    async fn test_endpoint_denial_short_circuits_global() {
        let (limiter, _) = limiter();

        for _ in 0..5 {
            assert!(limiter.admit("/api/contact", None, "10.0.0.1").await.is_allowed());
        }
        let admission = limiter.admit("/api/contact", None, "10.0.0.1").await;
        assert_eq!(rejected_scope(&admission), Some(Scope::Endpoint));

        // The rejected request never reached the global budget: 5 used, not 6.
        match limiter.check_request("/api/projects", IdentityTier::Default, "10.0.0.1") {
            Admission::Admitted { governing, .. } => {
                assert_eq!(governing.unwrap().remaining, 100 - 6);
            }
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_global_denial_after_endpoint_pass() {
        let mut config = RateLimitingConfig::default();
        config.tiers.default = PolicyRule::new(3, 60);
        let (limiter, _) = limiter_with(config);

        for _ in 0..3 {
            assert!(limiter.admit("/api/projects", None, "10.0.0.1").await.is_allowed());
        }

        let admission = limiter.admit("/api/contact", None, "10.0.0.1").await;
        match &admission {
            Admission::Rejected { key, policy, decision } => {
                assert_eq!(key.scope, Scope::Global);
                assert_eq!(policy.limit(), 3);
                assert_eq!(decision.retry_after, Some(60));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        // The endpoint budget was charged before the global budget denied.
        assert!(limiter.is_tracked(&RateLimitKey::endpoint("/api/contact", "10.0.0.1")));
    }

    #[tokio::test]
    async fn test_window_slides_with_clock() {
        let mut config = RateLimitingConfig::default();
        config.tiers.default = PolicyRule::new(2, 60);
        let (limiter, clock) = limiter_with(config);

        limiter.admit("/api/projects", None, "10.0.0.1").await;
        clock.advance(Duration::from_secs(30));
        limiter.admit("/api/projects", None, "10.0.0.1").await;
        assert!(!limiter.admit("/api/projects", None, "10.0.0.1").await.is_allowed());

        clock.advance(Duration::from_secs(31));
        assert!(limiter.admit("/api/projects", None, "10.0.0.1").await.is_allowed());
    }

    #[tokio::test]
    async fn test_bypassed_path_creates_no_state() {
        let (limiter, _) = limiter();

        for _ in 0..1000 {
            assert_eq!(
                limiter.admit("/api/health", None, "10.0.0.1").await,
                Admission::Bypassed
            );
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_counter_fault_fails_open() {
        let mut config = RateLimitingConfig::default();
        config.tiers.default = PolicyRule::new(1, 60);
        let (limiter, clock) = limiter_with(config);

        assert!(limiter.admit("/api/projects", None, "10.0.0.1").await.is_allowed());
        assert!(!limiter.admit("/api/projects", None, "10.0.0.1").await.is_allowed());

        clock.rewind(Duration::from_secs(30));
        let admission = limiter.admit("/api/projects", None, "10.0.0.1").await;
        assert_eq!(
            admission,
            Admission::Admitted {
                tier: IdentityTier::Default,
                governing: None,
            }
        );
    }

    #[tokio::test]
    async fn test_reset_epoch_uses_wall_clock() {
        let (limiter, clock) = limiter();

        let admission = limiter.admit("/api/projects", None, "10.0.0.1").await;
        let Admission::Admitted { governing: Some(decision), .. } = admission else {
            panic!("expected admission");
        };

        assert_eq!(
            limiter.reset_epoch(&decision),
            (clock.wall_now() + chrono::Duration::seconds(60)).timestamp()
        );
    }
}
