//! Caller identity classification.
//!
//! The admission layer only needs a coarse tier per request. Tiers select a
//! global policy; they never change how the client itself is keyed.

mod classifier;
mod token;

pub use classifier::IdentityClassifier;
pub use token::{AccessClaims, JwtVerifier, TokenError, TokenVerifier};

use std::fmt;

/// Coarse identity tier used to select a global policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IdentityTier {
    /// Anonymous or unverifiable callers
    #[default]
    Default,
    /// Callers presenting a currently valid access token
    Privileged,
}

impl IdentityTier {
    /// Get the tier name used in keys and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityTier::Default => "default",
            IdentityTier::Privileged => "privileged",
        }
    }
}

impl fmt::Display for IdentityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
