//! Error types for Ratekeeper.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// A rate string did not match `<amount>/[<multiples> ]<period>`
    #[error("Invalid rate format: {0}")]
    InvalidRateFormat(String),

    /// A strategy name that is not one of the supported strategies
    #[error(
        "Unknown strategy {0}, must be one of fixed-window, fixed-window-elastic-expiry, moving-window"
    )]
    UnknownStrategy(String),

    /// An identifier that cannot address a counter
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Mutually exclusive options were both supplied
    #[error("Configuration conflict: {0}")]
    ConfigConflict(String),

    /// The counter store backend could not be reached
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for RatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        RatekeeperError::StoreUnavailable(err.to_string())
    }
}

impl From<crate::mesh::ClusterError> for RatekeeperError {
    fn from(err: crate::mesh::ClusterError) -> Self {
        RatekeeperError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
