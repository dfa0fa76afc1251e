//! Error types for Ratekeeper.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// A limiter or engine parameter violates its constraint.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The external backing store could not be reached.
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// Optimistic updates kept losing races against other writers.
    #[error("State for key '{key}' could not be committed after {attempts} attempts")]
    Contention {
        /// The contended key
        key: String,
        /// Number of read-decide-swap rounds attempted
        attempts: usize,
    },

    /// A weighted request asked for a cost the engine cannot grant.
    #[error("Invalid request cost {cost}: {reason}")]
    InvalidCost { cost: u64, reason: String },

    /// A decision was requested for a policy that is not configured.
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// Serialized state could not be encoded or decoded.
    #[error("State codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatekeeperError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        RatekeeperError::InvalidConfiguration(message.into())
    }
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::InvalidConfiguration(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
