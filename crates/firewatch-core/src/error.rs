//! Error types for Firewatch

use thiserror::Error;

/// Result type alias for Firewatch core operations
pub type FirewatchResult<T> = Result<T, FirewatchError>;

/// Main error type for configuration and process setup
#[derive(Error, Debug)]
pub enum FirewatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FirewatchError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new logging error
    pub fn logging(msg: impl Into<String>) -> Self {
        Self::Logging(msg.into())
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            FirewatchError::Config(_) => "config",
            FirewatchError::Logging(_) => "logging",
            FirewatchError::Io(_) => "io",
            FirewatchError::Url(_) => "url",
            FirewatchError::Json(_) => "json",
        }
    }
}
