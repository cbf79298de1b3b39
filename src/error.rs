//! Error types for setup, transport and configuration.
//!
//! Outcomes of governed calls use [`GovernedError`](crate::safety::GovernedError) instead,
//! which is cloneable so it can be shared between deduplicated callers.

use thiserror::Error;

use crate::safety::GovernedError;

/// Result type alias using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the governor crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unparsable configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A governed call failed
    #[error(transparent)]
    Governed(#[from] GovernedError),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns true if this error represents a transport-level timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::HttpClient(e) => e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyLimit;

    #[test]
    fn test_error_display() {
        let err = Error::Config("max_concurrency must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_concurrency must be at least 1"
        );
    }

    #[test]
    fn test_governed_error_is_transparent() {
        let limit = SafetyLimit::concurrency_timeout(std::time::Duration::from_secs(5), 3);
        let message = limit.message().to_string();
        let err: Error = GovernedError::from(limit).into();
        assert_eq!(err.to_string(), message);
        assert!(!err.is_timeout());
    }
}
