//! Error types for the agent network

use thiserror::Error;

/// Main error type for mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Connect, publish or subscribe failure
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed domain object (empty id, out-of-range value, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed wire bytes
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Expired help request
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MeshError::Validation(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        MeshError::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type alias for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::validation("agent id must not be empty");
        assert_eq!(err.to_string(), "Validation error: agent id must not be empty");

        let err = MeshError::Network("publish failed".to_string());
        assert_eq!(err.to_string(), "Network error: publish failed");
    }

    #[test]
    fn test_from_serde_json() {
        let err: MeshError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, MeshError::Serialization(_)));
    }
}
