//! Access token verification.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Result, TurnstileError};

/// Token type claim required on access tokens.
const ACCESS_TOKEN_TYPE: &str = "access";

/// Reasons a credential failed verification.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token could not be parsed
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The token is past its expiry
    #[error("token has expired")]
    Expired,

    /// The token parsed but is not acceptable
    #[error("token rejected: {0}")]
    Rejected(String),

    /// The verifier itself could not answer
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator that decides whether a bearer token is currently
/// valid.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a raw bearer token.
    async fn verify(&self, token: &str) -> std::result::Result<(), TokenError>;
}

/// Claims carried by access tokens issued by the protected service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
    /// Token type: only "access" tokens are accepted
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// HMAC-signed JWT verifier.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    ///
    /// Only the HMAC family is accepted, since a shared secret cannot verify
    /// asymmetric signatures.
    pub fn new(secret: &str, algorithm: Algorithm) -> Result<Self> {
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(TurnstileError::Config(format!(
                "unsupported JWT algorithm {:?}: only HS256, HS384 and HS512 are supported",
                algorithm
            )));
        }
        if secret.is_empty() {
            return Err(TurnstileError::Config("JWT secret must not be empty".to_string()));
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(algorithm),
        })
    }

    /// Decode and validate a token, returning its claims.
    pub fn decode(&self, token: &str) -> std::result::Result<AccessClaims, TokenError> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => TokenError::Malformed(e.to_string()),
                _ => TokenError::Rejected(e.to_string()),
            },
        )?;

        match data.claims.token_type.as_deref() {
            Some(ACCESS_TOKEN_TYPE) => Ok(data.claims),
            other => Err(TokenError::Rejected(format!(
                "expected token type {:?}, got {:?}",
                ACCESS_TOKEN_TYPE, other
            ))),
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> std::result::Result<(), TokenError> {
        self.decode(token).map(|_| ())
    }
}
