//! In-memory fleet registry
//!
//! The workers started by one controller run, keyed by runtime id. Shared
//! between the polling loop and the signal handler, so every access goes
//! through an async `RwLock`. Sweeps work on a snapshot and apply their
//! removals in one write.

use corral_core::domain::worker::{ContainerStatus, WorkerInstance};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct Fleet {
    workers: Arc<RwLock<Vec<WorkerInstance>>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worker, replacing any entry with the same runtime id
    pub async fn insert(&self, worker: WorkerInstance) {
        let mut workers = self.workers.write().await;
        match workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => *existing = worker,
            None => workers.push(worker),
        }
    }

    /// Removes every listed id in one step, returning how many were dropped
    pub async fn remove_many(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|w| !ids.contains(&w.id));
        before - workers.len()
    }

    pub async fn update_status(&self, id: &str, status: ContainerStatus) {
        if let Some(worker) = self.workers.write().await.iter_mut().find(|w| w.id == id) {
            worker.status = status;
        }
    }

    /// Copy of the current members in start order
    pub async fn snapshot(&self) -> Vec<WorkerInstance> {
        self.workers.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, id: &str) -> WorkerInstance {
        WorkerInstance::new(name, id, ContainerStatus::Running)
    }

    #[tokio::test]
    async fn test_insert_keeps_order() {
        let fleet = Fleet::new();
        fleet.insert(worker("fleet1_1", "a")).await;
        fleet.insert(worker("fleet1_2", "b")).await;

        let names: Vec<_> = fleet.snapshot().await.into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["fleet1_1", "fleet1_2"]);
    }

    #[tokio::test]
    async fn test_insert_replaces_same_id() {
        let fleet = Fleet::new();
        fleet.insert(worker("fleet1_1", "a")).await;
        fleet
            .insert(WorkerInstance::new("fleet1_1", "a", ContainerStatus::Exited))
            .await;

        let workers = fleet.snapshot().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, ContainerStatus::Exited);
    }

    #[tokio::test]
    async fn test_remove_many_is_atomic() {
        let fleet = Fleet::new();
        for (name, id) in [("w1", "a"), ("w2", "b"), ("w3", "c")] {
            fleet.insert(worker(name, id)).await;
        }

        let removed = fleet
            .remove_many(&["a".to_string(), "c".to_string(), "zz".to_string()])
            .await;
        assert_eq!(removed, 2);
        assert_eq!(fleet.len().await, 1);
        assert_eq!(fleet.snapshot().await[0].id, "b");
    }

    #[tokio::test]
    async fn test_clones_share_members() {
        let fleet = Fleet::new();
        let handle = fleet.clone();
        handle.insert(worker("w1", "a")).await;
        handle.update_status("a", ContainerStatus::Dead).await;

        assert!(!fleet.is_empty().await);
        assert_eq!(fleet.snapshot().await[0].status, ContainerStatus::Dead);
    }
}
