//! Worker domain model
//!
//! Represents a runner container started by the fleet controller.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A worker container tracked by one controller run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    /// Generated container name (`<base>_<n>`)
    pub name: String,

    /// Identifier assigned by the container runtime
    pub id: String,

    /// Status seen on the last inspection
    pub status: ContainerStatus,
}

impl WorkerInstance {
    pub fn new(name: impl Into<String>, id: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            status,
        }
    }
}

/// Container state as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// Any state string this crate does not know about
    Other(String),
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    /// Whether the container will never run again without outside help
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Other(s) => s,
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("running".parse::<ContainerStatus>().unwrap(), ContainerStatus::Running);
        assert_eq!("Exited".parse::<ContainerStatus>().unwrap(), ContainerStatus::Exited);
        assert_eq!(
            "weird".parse::<ContainerStatus>().unwrap(),
            ContainerStatus::Other("weird".to_string())
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(ContainerStatus::Running.is_running());
        assert!(!ContainerStatus::Created.is_running());
        assert!(ContainerStatus::Exited.is_terminal());
        assert!(ContainerStatus::Dead.is_terminal());
        assert!(!ContainerStatus::Paused.is_terminal());
        assert_eq!(ContainerStatus::Restarting.to_string(), "restarting");
    }
}
