//! Error types for the registry client

use thiserror::Error;

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the remote registry
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed (connection, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Registry returned an error status code
    #[error("Registry error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error body returned by the registry
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// The registry answered but handed out no usable token
    #[error("Registry returned an empty bearer token")]
    EmptyToken,

    /// Image repository reference cannot be mapped onto the registry API
    #[error("Invalid image repository: {0}")]
    InvalidRepository(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if the failure is worth retrying later (timeouts, 5xx)
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(e) => e.is_timeout() || e.is_connect(),
            Self::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(!ClientError::api_error(404, "missing").is_transient());
        assert!(ClientError::api_error(503, "down").is_transient());
        assert!(!ClientError::api_error(401, "denied").is_transient());
        assert!(!ClientError::EmptyToken.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::api_error(500, "boom");
        assert_eq!(err.to_string(), "Registry error (status 500): boom");
    }
}
