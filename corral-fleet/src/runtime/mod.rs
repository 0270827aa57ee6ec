//! Container runtime seam
//!
//! The controller only needs a handful of runtime operations. They are
//! expressed as a trait so the fleet logic can run against the real runtime
//! ([`CliRuntime`]) or an in-memory fake in tests.

mod cli;

pub use cli::CliRuntime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_core::domain::image::ImageRecord;
use corral_core::domain::worker::ContainerStatus;
use std::collections::BTreeMap;
use tokio::io::AsyncWrite;

use crate::error::Result;

/// Writer receiving a container's combined stdout/stderr
pub type LogSink = Box<dyn AsyncWrite + Send + Unpin>;

/// An image in the local inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: DateTime<Utc>,
}

/// A container matched by a label query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
}

/// Inspected container state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
}

/// Everything needed to create and start one worker container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub binds: Vec<String>,
    pub cmd: Vec<String>,
}

/// Operations the fleet controller performs against the container runtime
///
/// Implementations must be safe to share between the polling loop, the
/// signal handler and the per-worker log tasks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List every local image
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    /// Inspect one local image by reference
    async fn inspect_image(&self, reference: &str) -> Result<ImageRecord>;

    /// Pull an image from its registry
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// List containers (running or not) carrying `key=value`
    async fn list_containers(&self, label_key: &str, label_value: &str)
    -> Result<Vec<ContainerSummary>>;

    /// Inspect a container by id or name
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// Create and start a container, returning its runtime id
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Send SIGKILL to a container
    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Remove a stopped container
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Follow a container's combined output into `sink` until the stream ends
    async fn stream_logs(&self, id: &str, sink: LogSink) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory runtime used by the controller, resolver and log tests

    use super::*;
    use crate::error::FleetError;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub id: String,
        pub name: String,
        pub status: ContainerStatus,
        pub labels: BTreeMap<String, String>,
        pub logs: String,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub images: Vec<ImageSummary>,
        pub containers: Vec<FakeContainer>,
        pub failing_creates: HashSet<String>,
        /// Container name to the number of inspections that still fail
        pub failing_inspections: HashMap<String, usize>,
        pub failing_removes: HashSet<String>,
        pub created: Vec<ContainerSpec>,
        pub killed: Vec<String>,
        pub removed: Vec<String>,
        pub pulled: Vec<String>,
        pub next_id: u32,
        /// Status a container switches to when killed
        pub status_after_kill: Option<ContainerStatus>,
    }

    #[derive(Default)]
    pub struct FakeRuntime {
        pub state: Mutex<FakeState>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            let runtime = Self::default();
            runtime.state.lock().unwrap().status_after_kill = Some(ContainerStatus::Exited);
            runtime
        }

        pub fn with_images(images: Vec<ImageSummary>) -> Self {
            let runtime = Self::new();
            runtime.state.lock().unwrap().images = images;
            runtime
        }

        pub fn fail_create(&self, name: &str) {
            self.state
                .lock()
                .unwrap()
                .failing_creates
                .insert(name.to_string());
        }

        pub fn add_container(&self, name: &str, status: ContainerStatus, labels: &[(&str, &str)]) -> String {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("id{}", state.next_id);
            state.containers.push(FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                status,
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                logs: String::new(),
            });
            id
        }

        pub fn fail_inspections(&self, name: &str, times: usize) {
            self.state
                .lock()
                .unwrap()
                .failing_inspections
                .insert(name.to_string(), times);
        }

        pub fn inspections_left(&self, name: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .failing_inspections
                .get(name)
                .copied()
                .unwrap_or(0)
        }

        pub fn fail_remove(&self, name: &str) {
            self.state
                .lock()
                .unwrap()
                .failing_removes
                .insert(name.to_string());
        }

        pub fn set_all_status(&self, status: ContainerStatus) {
            let mut state = self.state.lock().unwrap();
            for c in state.containers.iter_mut() {
                c.status = status.clone();
            }
        }

        pub fn removed(&self) -> Vec<String> {
            self.state.lock().unwrap().removed.clone()
        }

        pub fn killed(&self) -> Vec<String> {
            self.state.lock().unwrap().killed.clone()
        }

        pub fn created(&self) -> Vec<ContainerSpec> {
            self.state.lock().unwrap().created.clone()
        }

        pub fn pulled(&self) -> Vec<String> {
            self.state.lock().unwrap().pulled.clone()
        }

        pub fn container_names(&self) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .containers
                .iter()
                .map(|c| c.name.clone())
                .collect()
        }

        fn find(&self, id: &str) -> Option<FakeContainer> {
            self.state
                .lock()
                .unwrap()
                .containers
                .iter()
                .find(|c| c.id == id || c.name == id)
                .cloned()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_images(&self) -> Result<Vec<ImageSummary>> {
            Ok(self.state.lock().unwrap().images.clone())
        }

        async fn inspect_image(&self, reference: &str) -> Result<ImageRecord> {
            let state = self.state.lock().unwrap();
            state
                .images
                .iter()
                .find(|i| i.repo_tags.iter().any(|t| t == reference))
                .map(|i| ImageRecord::new(reference, i.created).with_digest(i.id.clone()))
                .ok_or_else(|| FleetError::runtime("inspect image", reference, "no such image"))
        }

        async fn pull_image(&self, reference: &str) -> Result<()> {
            self.state.lock().unwrap().pulled.push(reference.to_string());
            Ok(())
        }

        async fn list_containers(
            &self,
            label_key: &str,
            label_value: &str,
        ) -> Result<Vec<ContainerSummary>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .containers
                .iter()
                .filter(|c| c.labels.get(label_key).map(String::as_str) == Some(label_value))
                .map(|c| ContainerSummary {
                    id: c.id.clone(),
                    name: c.name.clone(),
                })
                .collect())
        }

        async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
            let container = self
                .find(id)
                .ok_or_else(|| FleetError::runtime("inspect", id, "no such container"))?;

            let mut state = self.state.lock().unwrap();
            if let Some(left) = state.failing_inspections.get_mut(&container.name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FleetError::runtime("inspect", id, "not yet visible"));
                }
            }

            Ok(ContainerDetails {
                id: container.id,
                name: container.name,
                status: container.status,
            })
        }

        async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            if state.failing_creates.contains(&spec.name) {
                return Err(FleetError::runtime("run", &spec.name, "create failed"));
            }
            state.next_id += 1;
            let id = format!("id{}", state.next_id);
            state.created.push(spec.clone());
            state.containers.push(FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                status: ContainerStatus::Running,
                labels: spec.labels.clone(),
                logs: String::new(),
            });
            Ok(id)
        }

        async fn kill_container(&self, id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let after = state.status_after_kill.clone();
            let container = state
                .containers
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| FleetError::runtime("kill", id, "no such container"))?;
            if let Some(status) = after {
                container.status = status;
            }
            state.killed.push(id.to_string());
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let refused = state
                .containers
                .iter()
                .any(|c| c.id == id && state.failing_removes.contains(&c.name));
            if refused {
                return Err(FleetError::runtime("remove", id, "container is restarting"));
            }
            let before = state.containers.len();
            state.containers.retain(|c| c.id != id);
            if state.containers.len() == before {
                return Err(FleetError::runtime("remove", id, "no such container"));
            }
            state.removed.push(id.to_string());
            Ok(())
        }

        async fn stream_logs(&self, id: &str, mut sink: LogSink) -> Result<()> {
            let logs = self
                .find(id)
                .map(|c| c.logs)
                .ok_or_else(|| FleetError::runtime("logs", id, "no such container"))?;
            sink.write_all(logs.as_bytes())
                .await
                .map_err(|e| FleetError::runtime("logs", id, e.to_string()))?;
            sink.shutdown()
                .await
                .map_err(|e| FleetError::runtime("logs", id, e.to_string()))?;
            Ok(())
        }
    }
}
