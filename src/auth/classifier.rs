//! Bearer credential classification.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, trace, warn};

use super::token::{JwtVerifier, TokenVerifier};
use super::IdentityTier;
use crate::config::AuthConfig;
use crate::error::Result;

/// Upper bound on how long a verifier may hold up a request.
const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Maps a request's `Authorization` header to an [`IdentityTier`].
///
/// Classification is infallible. A missing or malformed header, a rejected
/// token, a verifier error, a verifier timeout and a verifier panic all map
/// to [`IdentityTier::Default`].
#[derive(Clone)]
pub struct IdentityClassifier {
    verifier: Option<Arc<dyn TokenVerifier>>,
    timeout: Duration,
}

impl IdentityClassifier {
    /// Create a classifier backed by `verifier`.
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier: Some(verifier),
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    /// A classifier with no verifier; every caller is `default`.
    pub fn anonymous() -> Self {
        Self {
            verifier: None,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    /// Build from configuration. No secret means [`Self::anonymous`].
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match config.jwt_secret.as_deref() {
            Some(secret) => {
                let verifier = JwtVerifier::new(secret, config.jwt_algorithm)?;
                Ok(Self::new(Arc::new(verifier)))
            }
            None => Ok(Self::anonymous()),
        }
    }

    /// Override the verification timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Classify a request from its raw `Authorization` header value.
    pub async fn classify(&self, authorization: Option<&str>) -> IdentityTier {
        let Some(verifier) = &self.verifier else {
            return IdentityTier::Default;
        };
        let Some(token) = bearer_token(authorization) else {
            trace!("No bearer credential, using default tier");
            return IdentityTier::Default;
        };

        let verification = AssertUnwindSafe(verifier.verify(token)).catch_unwind();
        match tokio::time::timeout(self.timeout, verification).await {
            Ok(Ok(Ok(()))) => IdentityTier::Privileged,
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "Credential verification failed, using default tier");
                IdentityTier::Default
            }
            Ok(Err(_)) => {
                warn!("Token verifier panicked, using default tier");
                IdentityTier::Default
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Token verifier timed out, using default tier");
                IdentityTier::Default
            }
        }
    }
}

impl std::fmt::Debug for IdentityClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityClassifier")
            .field("verifier", &self.verifier.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Extract the token from a `Bearer <token>` header value.
fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    let (scheme, token) = authorization?.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
