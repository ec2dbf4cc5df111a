//! Rate limit key generation and handling.

use std::fmt;

/// Which budget a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A per-path budget for one client
    Endpoint,
    /// A tier-wide budget for one client across all paths
    Global,
}

impl Scope {
    /// Get the scope name used in key fingerprints and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Endpoint => "endpoint",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one client's budget within a scope.
///
/// The target is the request path for [`Scope::Endpoint`] keys and the tier
/// name for [`Scope::Global`] keys. Privileged clients are still keyed by
/// their client identifier; the tier only selects which policy applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The scope this key belongs to
    pub scope: Scope,
    /// Request path or tier name
    pub target: String,
    /// Client identifier, usually the remote IP
    pub client: String,
}

impl RateLimitKey {
    /// Create a key for a per-path budget.
    pub fn endpoint(path: &str, client: &str) -> Self {
        Self {
            scope: Scope::Endpoint,
            target: path.to_string(),
            client: client.to_string(),
        }
    }

    /// Create a key for a tier-wide budget.
    pub fn global(tier: &str, client: &str) -> Self {
        Self {
            scope: Scope::Global,
            target: tier.to_string(),
            client: client.to_string(),
        }
    }

    /// Convert the key to its `scope:target:client` fingerprint.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.scope, self.target, self.client)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_endpoint_key_creation() {
        let key = RateLimitKey::endpoint("/api/contact", "10.0.0.1");

        assert_eq!(key.scope, Scope::Endpoint);
        assert_eq!(key.target, "/api/contact");
        assert_eq!(key.client, "10.0.0.1");
    }

    #[test]
    fn test_key_to_string() {
        let key = RateLimitKey::global("privileged", "10.0.0.1");
        assert_eq!(key.to_string_key(), "global:privileged:10.0.0.1");
        assert_eq!(key.to_string(), "global:privileged:10.0.0.1");
    }

    #[test]
    fn test_key_equality_is_stable() {
        let key1 = RateLimitKey::endpoint("/api/contact", "10.0.0.1");
        let key2 = RateLimitKey::endpoint("/api/contact", "10.0.0.1");
        assert_eq!(key1, key2);

        let mut set = HashSet::new();
        set.insert(key1);
        assert!(set.contains(&key2));
    }

    #[test]
    fn test_scopes_do_not_collide() {
        // A path that happens to equal a tier name must still be a distinct key.
        let endpoint = RateLimitKey::endpoint("default", "10.0.0.1");
        let global = RateLimitKey::global("default", "10.0.0.1");
        assert_ne!(endpoint, global);
    }
}
