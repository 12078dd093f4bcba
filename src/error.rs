//! Error types for Windowkeeper.

use thiserror::Error;

/// Main error type for Windowkeeper operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limiter or store configuration. Fatal at construction time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A hit store could not be read or written.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A persisted hit history could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error came from the hit store rather than from the caller.
    pub fn is_backend(&self) -> bool {
        matches!(self, LimiterError::Backend(_))
    }
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Configuration(err.to_string())
    }
}

impl From<serde_yaml::Error> for LimiterError {
    fn from(err: serde_yaml::Error) -> Self {
        LimiterError::Configuration(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        LimiterError::Backend(err.to_string())
    }
}

/// Result type alias for Windowkeeper operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
