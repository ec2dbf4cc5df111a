//! Configuration management for Turnstile.
//!
//! Settings are static for the life of the process. They come from an
//! optional YAML file layered under `TURNSTILE__`-prefixed environment
//! variables (`TURNSTILE__SERVER__LISTEN_ADDR=0.0.0.0:9000`).

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{PolicyResolver, PolicyRule};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Credential verification configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Per-path budgets, matched exactly against the request path
    #[serde(default = "default_endpoints")]
    pub endpoints: HashMap<String, PolicyRule>,

    /// Global budgets per identity tier
    #[serde(default)]
    pub tiers: TierRules,

    /// Path prefixes exempt from all limiting
    #[serde(default = "default_bypass_prefixes")]
    pub bypass_prefixes: Vec<String>,

    /// Seconds between cleanup sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds a key may sit idle before the sweep reclaims it
    #[serde(default = "default_idle_retention")]
    pub idle_retention_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            tiers: TierRules::default(),
            bypass_prefixes: default_bypass_prefixes(),
            sweep_interval_secs: default_sweep_interval(),
            idle_retention_secs: default_idle_retention(),
        }
    }
}

fn default_endpoints() -> HashMap<String, PolicyRule> {
    HashMap::from([
        ("/api/contact".to_string(), PolicyRule::new(5, 60)),
        ("/api/admin/upload".to_string(), PolicyRule::new(10, 60)),
        ("/api/admin/login".to_string(), PolicyRule::new(5, 300)),
    ])
}

fn default_bypass_prefixes() -> Vec<String> {
    ["/api/health", "/docs", "/redoc", "/openapi.json", "/uploads/", "/favicon.ico"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_retention() -> u64 {
    3600
}

impl RateLimitingConfig {
    /// Interval between cleanup sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Idle threshold after which a key is reclaimed.
    pub fn idle_retention(&self) -> Duration {
        Duration::from_secs(self.idle_retention_secs)
    }

    /// Validate policies and sweeper settings, returning the resolver.
    ///
    /// The idle threshold may not be shorter than the longest window, or a
    /// sweep would discard events that still count against a budget.
    pub fn validate(&self) -> Result<PolicyResolver> {
        if let Some(path) = self.endpoints.keys().find(|path| !path.starts_with('/')) {
            return Err(TurnstileError::Config(format!(
                "endpoint path {:?} must start with '/'",
                path
            )));
        }

        let resolver = PolicyResolver::from_config(self)?;

        if self.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.idle_retention() < resolver.max_window() {
            return Err(TurnstileError::Config(format!(
                "idle_retention_secs ({}) is shorter than the longest window ({}s)",
                self.idle_retention_secs,
                resolver.max_window().as_secs()
            )));
        }

        Ok(resolver)
    }
}

/// Global policies per identity tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierRules {
    /// Budget for unauthenticated or unverifiable callers
    #[serde(default = "default_tier_rule")]
    pub default: PolicyRule,

    /// Budget for callers presenting a valid credential
    #[serde(default = "privileged_tier_rule", alias = "admin")]
    pub privileged: PolicyRule,
}

impl Default for TierRules {
    fn default() -> Self {
        Self {
            default: default_tier_rule(),
            privileged: privileged_tier_rule(),
        }
    }
}

fn default_tier_rule() -> PolicyRule {
    PolicyRule::new(100, 60)
}

fn privileged_tier_rule() -> PolicyRule {
    PolicyRule::new(500, 60)
}

/// Credential verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for access tokens. Without one, every caller is
    /// classified into the default tier.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// HMAC algorithm the tokens are signed with
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: Algorithm,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_algorithm: default_jwt_algorithm(),
        }
    }
}

fn default_jwt_algorithm() -> Algorithm {
    Algorithm::HS256
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// The file is parsed with `serde_yaml` so endpoint paths keep their
    /// case. Environment variables may only override scalar settings;
    /// endpoint maps come from the file alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut loaded = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration file");
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        let env = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        loaded.apply_env_overrides(&env)?;

        Ok(loaded)
    }

    fn apply_env_overrides(&mut self, env: &config::Config) -> Result<()> {
        if let Some(addr) = env_override(env, "server.listen_addr")? {
            self.server.listen_addr = parse_override("server.listen_addr", &addr)?;
        }

        let limits = &mut self.rate_limiting;
        if let Some(secs) = env_override(env, "rate_limiting.sweep_interval_secs")? {
            limits.sweep_interval_secs = parse_override("rate_limiting.sweep_interval_secs", &secs)?;
        }
        if let Some(secs) = env_override(env, "rate_limiting.idle_retention_secs")? {
            limits.idle_retention_secs = parse_override("rate_limiting.idle_retention_secs", &secs)?;
        }
        for (tier, rule) in [
            ("default", &mut limits.tiers.default),
            ("privileged", &mut limits.tiers.privileged),
        ] {
            let limit_key = format!("rate_limiting.tiers.{}.limit", tier);
            if let Some(limit) = env_override(env, &limit_key)? {
                rule.limit = parse_override(&limit_key, &limit)?;
            }
            let window_key = format!("rate_limiting.tiers.{}.window_secs", tier);
            if let Some(window) = env_override(env, &window_key)? {
                rule.window_secs = parse_override(&window_key, &window)?;
            }
        }

        if let Some(secret) = env_override(env, "auth.jwt_secret")? {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(algorithm) = env_override(env, "auth.jwt_algorithm")? {
            self.auth.jwt_algorithm = parse_override("auth.jwt_algorithm", &algorithm)?;
        }

        Ok(())
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

fn env_override(env: &config::Config, key: &str) -> Result<Option<String>> {
    match env.get_string(key) {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_override<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| {
        TurnstileError::Config(format!("invalid environment override for {}: {}", key, e))
    })
}
