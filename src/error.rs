//! Error types for Ratewarden.

use reqwest::StatusCode;
use thiserror::Error;

/// Boxed error produced by a transport implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for Ratewarden operations.
///
/// Rate-limit waits are internal and never show up here; only an exhausted
/// retry budget, caller deadlines and transport failures cross the boundary.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The server kept rejecting a call with 429 until the attempt budget ran out
    #[error("Rate limited on {route} after {attempts} attempts")]
    RateLimitExceededRetries { route: String, attempts: u32 },

    /// A caller-imposed deadline elapsed while the request was waiting or in flight
    #[error("Request on {route} timed out")]
    Timeout { route: String },

    /// Connection-level failures, passed through unmodified
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// Non-success, non-429 response
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Whether this error was caused by server-side rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, WardenError::RateLimitExceededRetries { .. })
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
