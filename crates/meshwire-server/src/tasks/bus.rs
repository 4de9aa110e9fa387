//! The task bus: persist first, then deliver.
//!
//! Tasks are rows before they are frames. A failed delivery leaves the
//! row in `pending`; the coordinator never retries on its own, because
//! the agent is authoritative about execution and a silent retry could
//! race a reconnecting agent. Re-push is operator-driven.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use meshwire_core::db::{unix_timestamp, unix_timestamp_nanos};
use meshwire_proto::v1::TaskFrame;

use crate::error::{Result, ServerError};
use crate::registry::SessionRegistry;
use crate::storage::{Store, Task, TaskFilter, TaskKind, TaskStatus};

/// Delay between per-node tasks of a fleet-wide broadcast, so a
/// partially-converged mesh does not reconnect everything at once.
const BROADCAST_STAGGER: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct TaskBus {
    store: Arc<dyn Store>,
    registry: SessionRegistry,
    stagger: Duration,
}

impl TaskBus {
    pub fn new(store: Arc<dyn Store>, registry: SessionRegistry) -> Self {
        Self {
            store,
            registry,
            stagger: BROADCAST_STAGGER,
        }
    }

    /// Override the broadcast stagger (tests).
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    /// Create a task for one node, persist it, and attempt delivery.
    pub async fn create(&self, kind: TaskKind, node_id: i64) -> Result<Task> {
        // The target must exist; tasks for unknown nodes are operator
        // errors, not pending work.
        self.store.get_node(node_id).await?;

        let task = Task {
            id: format!("{}_{}", kind.as_str(), unix_timestamp_nanos()),
            kind,
            node_id,
            status: TaskStatus::Pending,
            error: None,
            created_at: unix_timestamp(),
            started_at: None,
            completed_at: None,
        };
        self.store.create_task(task.clone()).await?;

        let task = self.push(&task.id).await?;
        Ok(task)
    }

    /// Attempt live delivery of a persisted task.
    ///
    /// On send failure the task stays `pending`; the row itself is the
    /// offline buffer.
    pub async fn push(&self, task_id: &str) -> Result<Task> {
        let mut task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(ServerError::Validation(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }

        task.started_at = Some(unix_timestamp());
        self.store.update_task(task.clone()).await?;

        let frame = TaskFrame {
            task_id: task.id.clone(),
            kind: task.kind.as_str().to_string(),
        };
        match self.registry.send(task.node_id, frame).await {
            Ok(()) => {
                info!(task_id = %task.id, node_id = task.node_id, "Task pushed to node");
            }
            Err(e) => {
                info!(
                    task_id = %task.id,
                    node_id = task.node_id,
                    reason = %e,
                    "Task left pending; node has no live stream"
                );
            }
        }
        Ok(task)
    }

    /// Apply a status transition reported by the agent.
    ///
    /// Legal transitions: pending -> running -> success | failed, plus
    /// canceled from any non-terminal state. Terminal states are final.
    pub async fn report_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task> {
        let mut task = self.store.get_task(task_id).await?;

        if task.status.is_terminal() {
            return Err(ServerError::Validation(format!(
                "task {task_id} is already {}; no further transitions",
                task.status
            )));
        }
        let legal = match status {
            TaskStatus::Running => task.status == TaskStatus::Pending,
            TaskStatus::Success | TaskStatus::Failed => task.status == TaskStatus::Running,
            TaskStatus::Canceled => true,
            TaskStatus::Pending => false,
        };
        if !legal {
            return Err(ServerError::Validation(format!(
                "illegal task transition {} -> {status}",
                task.status
            )));
        }

        let now = unix_timestamp();
        task.status = status;
        task.error = error;
        match status {
            TaskStatus::Running => {
                task.started_at.get_or_insert(now);
            }
            _ => {
                task.completed_at = Some(now);
            }
        }
        self.store.update_task(task.clone()).await?;

        info!(task_id = %task.id, status = %task.status, "Task status updated");
        Ok(task)
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter).await?)
    }

    /// Enqueue one configuration-update task per fleet member,
    /// staggered so agents restart tunnels in sequence, not in unison.
    pub async fn broadcast_config_update(&self) -> Result<Vec<Task>> {
        let nodes = self.store.list_nodes().await?;
        let mut tasks = Vec::with_capacity(nodes.len());

        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                sleep(self.stagger).await;
            }
            match self.create(TaskKind::ConfigUpdate, node.id).await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(node_id = node.id, error = %e, "Broadcast task creation failed");
                }
            }
        }

        Ok(tasks)
    }

    /// Delete terminal tasks older than the retention window.
    pub async fn cleanup(&self, retention_secs: i64) -> Result<u64> {
        let removed = self.store.cleanup_tasks(retention_secs).await?;
        if removed > 0 {
            info!(removed, "Expired terminal tasks removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, NewNode};

    async fn test_bus() -> (Arc<MemoryStore>, SessionRegistry, TaskBus) {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new();
        let bus = TaskBus::new(store.clone(), registry.clone())
            .with_stagger(Duration::from_millis(1));
        (store, registry, bus)
    }

    async fn add_node(store: &Arc<MemoryStore>, name: &str) -> i64 {
        store
            .create_node(NewNode {
                name: name.into(),
                token: format!("token-{name}"),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn create_persists_pending_when_offline() {
        let (store, _registry, bus) = test_bus().await;
        let node_id = add_node(&store, "a").await;

        let task = bus.create(TaskKind::ConfigUpdate, node_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.id.starts_with("config_update_"));

        let stored = store.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn create_rejects_unknown_node() {
        let (_store, _registry, bus) = test_bus().await;
        let err = bus.create(TaskKind::ConfigUpdate, 99).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn push_delivers_to_bound_stream() {
        let (store, registry, bus) = test_bus().await;
        let node_id = add_node(&store, "a").await;

        registry.register(node_id, "tok".into()).await;
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        registry.bind_stream(node_id, tx).await.unwrap();

        let task = bus.create(TaskKind::ConfigUpdate, node_id).await.unwrap();

        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.task_id, task.id);
        assert_eq!(frame.kind, "config_update");
    }

    #[tokio::test]
    async fn status_transitions_enforced() {
        let (store, _registry, bus) = test_bus().await;
        let node_id = add_node(&store, "a").await;
        let task = bus.create(TaskKind::ConfigUpdate, node_id).await.unwrap();

        // pending -> success is illegal; must pass through running
        assert!(bus
            .report_status(&task.id, TaskStatus::Success, None)
            .await
            .is_err());

        bus.report_status(&task.id, TaskStatus::Running, None)
            .await
            .unwrap();
        let done = bus
            .report_status(&task.id, TaskStatus::Success, None)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert!(done.completed_at.is_some());

        // Terminal is final
        let err = bus
            .report_status(&task.id, TaskStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_from_pending() {
        let (store, _registry, bus) = test_bus().await;
        let node_id = add_node(&store, "a").await;
        let task = bus.create(TaskKind::ConfigUpdate, node_id).await.unwrap();

        let canceled = bus
            .report_status(&task.id, TaskStatus::Canceled, None)
            .await
            .unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn broadcast_creates_one_task_per_node() {
        let (store, registry, bus) = test_bus().await;
        let a = add_node(&store, "a").await;
        let b = add_node(&store, "b").await;
        let c = add_node(&store, "c").await;

        // b is online; a and c are offline
        registry.register(b, "tok".into()).await;
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        registry.bind_stream(b, tx).await.unwrap();

        let tasks = bus.broadcast_config_update().await.unwrap();
        assert_eq!(tasks.len(), 3);

        let node_ids: Vec<i64> = tasks.iter().map(|t| t.node_id).collect();
        assert_eq!(node_ids, vec![a, b, c]);

        // Only b saw a frame; a's and c's tasks stay pending.
        assert_eq!(rx.recv().await.unwrap().unwrap().kind, "config_update");
        for task in &tasks {
            assert_eq!(
                store.get_task(&task.id).await.unwrap().status,
                TaskStatus::Pending
            );
        }
    }
}
