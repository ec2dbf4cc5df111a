//! Rate limit policies and request-to-policy resolution.
//!
//! A request resolves to at most two budgets, in evaluation order:
//!
//! 1. an endpoint budget, when the path exactly matches a configured endpoint
//! 2. the global budget of the caller's identity tier
//!
//! Paths under a bypass prefix resolve to nothing and never touch a counter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;

use super::key::RateLimitKey;
use crate::auth::IdentityTier;
use crate::config::RateLimitingConfig;
use crate::error::{Result, TurnstileError};

/// A limit/window pair as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Number of requests admitted per window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl PolicyRule {
    /// Create a new rule.
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// Validate the rule into a [`Policy`].
    pub fn to_policy(&self) -> Result<Policy> {
        Policy::new(self.limit, Duration::from_secs(self.window_secs))
    }
}

/// A validated, immutable rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    limit: u32,
    window: Duration,
}

impl Policy {
    /// Create a policy. Both the limit and the window must be positive.
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "rate limit must be a positive number of requests".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "rate limit window must be a positive duration".to_string(),
            ));
        }
        Ok(Self { limit, window })
    }

    /// Requests admitted per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Sustained rate in requests per second.
    pub fn per_second(&self) -> f64 {
        f64::from(self.limit) / self.window.as_secs_f64()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.limit, self.window.as_secs())
    }
}

/// One budget a request must fit in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    /// Counter key for this client and scope
    pub key: RateLimitKey,
    /// Policy to check the key against
    pub policy: Policy,
}

/// Maps requests to the budgets that govern them.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    endpoints: HashMap<String, Policy>,
    default_tier: Policy,
    privileged_tier: Policy,
    bypass_prefixes: Vec<String>,
}

impl PolicyResolver {
    /// Create a resolver from validated policies.
    pub fn new(
        endpoints: HashMap<String, Policy>,
        default_tier: Policy,
        privileged_tier: Policy,
        bypass_prefixes: Vec<String>,
    ) -> Self {
        if privileged_tier.per_second() < default_tier.per_second() {
            warn!(
                default = %default_tier,
                privileged = %privileged_tier,
                "Privileged tier is less permissive than the default tier"
            );
        }

        Self {
            endpoints,
            default_tier,
            privileged_tier,
            bypass_prefixes,
        }
    }

    /// Build a resolver from configuration, rejecting non-positive limits
    /// and windows.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let mut endpoints = HashMap::with_capacity(config.endpoints.len());
        for (path, rule) in &config.endpoints {
            let policy = rule.to_policy().map_err(|e| {
                TurnstileError::Config(format!("endpoint policy for {}: {}", path, e))
            })?;
            endpoints.insert(path.clone(), policy);
        }

        let default_tier = config.tiers.default.to_policy().map_err(|e| {
            TurnstileError::Config(format!("default tier policy: {}", e))
        })?;
        let privileged_tier = config.tiers.privileged.to_policy().map_err(|e| {
            TurnstileError::Config(format!("privileged tier policy: {}", e))
        })?;

        Ok(Self::new(
            endpoints,
            default_tier,
            privileged_tier,
            config.bypass_prefixes.clone(),
        ))
    }

    /// Whether `path` is exempt from all limiting.
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// The endpoint policy for an exact path, if any.
    pub fn endpoint_policy(&self, path: &str) -> Option<Policy> {
        self.endpoints.get(path).copied()
    }

    /// The global policy for a tier.
    pub fn tier_policy(&self, tier: IdentityTier) -> Policy {
        match tier {
            IdentityTier::Default => self.default_tier,
            IdentityTier::Privileged => self.privileged_tier,
        }
    }

    /// The longest window among all configured policies.
    pub fn max_window(&self) -> Duration {
        self.endpoints
            .values()
            .chain([&self.default_tier, &self.privileged_tier])
            .map(Policy::window)
            .max()
            .unwrap_or_default()
    }

    /// Resolve the budgets for a request, endpoint first and global last.
    ///
    /// Bypassed paths resolve to an empty list.
    pub fn resolve(&self, path: &str, tier: IdentityTier, client: &str) -> Vec<ResolvedPolicy> {
        if self.is_bypassed(path) {
            return Vec::new();
        }

        let mut resolved = Vec::with_capacity(2);
        if let Some(policy) = self.endpoint_policy(path) {
            resolved.push(ResolvedPolicy {
                key: RateLimitKey::endpoint(path, client),
                policy,
            });
        }
        resolved.push(ResolvedPolicy {
            key: RateLimitKey::global(tier.as_str(), client),
            policy: self.tier_policy(tier),
        });
        resolved
    }
}
