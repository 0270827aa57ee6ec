//! Fleet error types
//!
//! Errors are split by what the caller should do about them:
//! configuration and startup errors abort the command, runtime errors are
//! per-container and usually only logged.

use corral_registry::ClientError;
use thiserror::Error;

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Invalid run configuration, detected before any container exists
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Setup failed in a way that makes starting the fleet pointless
    #[error("{0}")]
    Startup(String),

    /// No runner image exists locally
    #[error(
        "No runner image exists in the local repository. Execute \"corral configure --pull\" to pull the required image."
    )]
    NoLocalImage,

    /// Local runner images exist but none is a released (latest/master) build
    #[error("No production runner image is available in the local repository")]
    NoProductionImage,

    /// Remote registry lists no usable runner image
    #[error("No runner image exists in the remote repository")]
    NoRemoteImage,

    /// Containers labeled for this base name already exist
    #[error("Runner(s) for {0} already started")]
    AlreadyRunning(String),

    /// Remote registry request failed
    #[error("Unable to access remote repository: {0}")]
    Registry(#[from] ClientError),

    /// A container runtime call failed
    #[error("{operation} failed for {target}: {message}")]
    Runtime {
        operation: &'static str,
        target: String,
        message: String,
    },
}

impl FleetError {
    pub fn runtime(
        operation: &'static str,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Runtime {
            operation,
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether the command must abort rather than log and continue
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Runtime { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_are_not_fatal() {
        let err = FleetError::runtime("inspect", "fleet1_1", "no such container");
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "inspect failed for fleet1_1: no such container"
        );
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(FleetError::Config("bad".to_string()).is_fatal());
        assert!(FleetError::AlreadyRunning("fleet1".to_string()).is_fatal());
    }
}
