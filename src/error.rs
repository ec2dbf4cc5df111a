//! Error types for the Turnstile admission layer.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Every variant is raised at startup. Nothing on the request path returns
/// this type: classification degrades to the default tier and counter
/// faults fail open.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid policy or sweeper settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while layering configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
