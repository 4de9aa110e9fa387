//! In-memory store backend for tests.
//!
//! One mutex over ordered maps. Holding the lock across a whole
//! operation is also what makes `get_or_create_pair_port` a single
//! linearization point.

use std::collections::BTreeMap;

use async_trait::async_trait;
use meshwire_core::db::unix_timestamp;
use tokio::sync::Mutex;

use super::models::{
    NewNode, Node, NodeUpdate, PairPort, StatusSnapshot, Task, TaskFilter, User,
};
use super::{Store, StoreError};

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<i64, Node>,
    /// Keyed by the canonical pair `(min, max)`.
    pair_ports: BTreeMap<(i64, i64), u16>,
    tasks: BTreeMap<String, Task>,
    status: BTreeMap<i64, StatusSnapshot>,
    users: BTreeMap<i64, User>,
    /// High-water mark; node identifiers are never reused, even after
    /// the highest node is deleted.
    last_node_id: i64,
    next_user_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_node(&self, node: NewNode) -> Result<Node, StoreError> {
        let mut inner = self.inner.lock().await;

        let id = match node.id {
            Some(id) => {
                if inner.nodes.contains_key(&id) {
                    return Err(StoreError::Conflict(format!("node {id} already exists")));
                }
                id
            }
            None => inner.last_node_id + 1,
        };
        inner.last_node_id = inner.last_node_id.max(id);

        let now = unix_timestamp();
        let created = Node {
            id,
            name: node.name,
            token: node.token,
            public_key: node.public_key,
            private_key: node.private_key,
            endpoints: node.endpoints,
            ipv4: node.ipv4,
            ipv6: node.ipv6,
            mtu: node.mtu,
            babel_interval: node.babel_interval,
            created_at: now,
            updated_at: now,
        };
        inner.nodes.insert(id, created.clone());
        Ok(created)
    }

    async fn get_node(&self, id: i64) -> Result<Node, StoreError> {
        self.inner
            .lock()
            .await
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.inner.lock().await.nodes.values().cloned().collect())
    }

    async fn update_node(&self, id: i64, update: NodeUpdate) -> Result<Node, StoreError> {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;

        if let Some(name) = update.name {
            node.name = name;
        }
        if let Some(endpoints) = update.endpoints {
            node.endpoints = endpoints;
        }
        if let Some(ipv4) = update.ipv4 {
            node.ipv4 = ipv4;
        }
        if let Some(ipv6) = update.ipv6 {
            node.ipv6 = ipv6;
        }
        if let Some(token) = update.token {
            node.token = token;
        }
        if let Some(interval) = update.babel_interval {
            node.babel_interval = interval;
        }
        node.updated_at = unix_timestamp();

        Ok(node.clone())
    }

    async fn delete_node(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.nodes.remove(&id).is_none() {
            return Err(StoreError::NotFound(format!("node {id}")));
        }
        inner
            .pair_ports
            .retain(|(a, b), _| *a != id && *b != id);
        inner.status.remove(&id);
        inner.tasks.retain(|_, t| t.node_id != id);
        Ok(())
    }

    async fn get_or_create_pair_port(
        &self,
        a: i64,
        b: i64,
        base_port: u16,
    ) -> Result<u16, StoreError> {
        if a == b {
            return Err(StoreError::Integrity(format!(
                "pair port requested for node {a} with itself"
            )));
        }
        let key = (a.min(b), a.max(b));

        let mut inner = self.inner.lock().await;
        if let Some(port) = inner.pair_ports.get(&key) {
            return Ok(*port);
        }

        let max_port = inner.pair_ports.values().max().copied().unwrap_or(0);
        let port = if max_port >= base_port {
            max_port
                .checked_add(1)
                .ok_or_else(|| StoreError::Integrity("pair port space exhausted".into()))?
        } else {
            base_port
        };

        inner.pair_ports.insert(key, port);
        Ok(port)
    }

    async fn list_pair_ports(&self) -> Result<Vec<PairPort>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .pair_ports
            .iter()
            .map(|(&(node_id, peer_id), &port)| PairPort {
                node_id,
                peer_id,
                port,
            })
            .collect())
    }

    async fn create_task(&self, task: Task) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.inner
            .lock()
            .await
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn update_task(&self, task: Task) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.tasks.contains_key(&task.id) {
            return Err(StoreError::NotFound(format!("task {}", task.id)));
        }
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn cleanup_tasks(&self, older_than_secs: i64) -> Result<u64, StoreError> {
        let cutoff = unix_timestamp() - older_than_secs;
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.len();
        inner.tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - inner.tasks.len()) as u64)
    }

    async fn upsert_node_status(&self, id: i64, status: StatusSnapshot) -> Result<(), StoreError> {
        self.inner.lock().await.status.insert(id, status);
        Ok(())
    }

    async fn get_node_status(&self, id: i64) -> Result<StatusSnapshot, StoreError> {
        self.inner
            .lock()
            .await
            .status
            .get(&id)
            .cloned()
            .map(StatusSnapshot::rounded)
            .ok_or_else(|| StoreError::NotFound(format!("status for node {id}")))
    }

    async fn list_node_status(&self) -> Result<Vec<StatusSnapshot>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .status
            .values()
            .cloned()
            .map(StatusSnapshot::rounded)
            .collect())
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.users.values().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!(
                "username {username} already exists"
            )));
        }
        inner.next_user_id += 1;
        let user = User {
            id: inner.next_user_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: unix_timestamp(),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User, StoreError> {
        self.inner
            .lock()
            .await
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .users
            .values()
            .any(|u| u.username == username))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::super::models::{TaskKind, TaskStatus};
    use super::*;

    fn new_node(name: &str) -> NewNode {
        NewNode {
            name: name.into(),
            token: format!("token-{name}"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn node_ids_are_monotonic_and_never_reused() {
        let store = MemoryStore::new();
        let a = store.create_node(new_node("a")).await.unwrap();
        let b = store.create_node(new_node("b")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        store.delete_node(b.id).await.unwrap();
        let c = store.create_node(new_node("c")).await.unwrap();
        assert_eq!(c.id, 3);
    }

    #[tokio::test]
    async fn duplicate_fixed_id_rejected() {
        let store = MemoryStore::new();
        store
            .create_node(NewNode {
                id: Some(5),
                ..new_node("a")
            })
            .await
            .unwrap();
        let err = store
            .create_node(NewNode {
                id: Some(5),
                ..new_node("b")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_preserves_token_unless_replaced() {
        let store = MemoryStore::new();
        let node = store.create_node(new_node("a")).await.unwrap();

        let updated = store
            .update_node(
                node.id,
                NodeUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.token, node.token);

        let updated = store
            .update_node(
                node.id,
                NodeUpdate {
                    token: Some("fresh".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.token, "fresh");
    }

    #[tokio::test]
    async fn pair_port_allocation_is_symmetric_and_stable() {
        let store = MemoryStore::new();
        let p1 = store.get_or_create_pair_port(1, 2, 36420).await.unwrap();
        let p2 = store.get_or_create_pair_port(2, 1, 36420).await.unwrap();
        assert_eq!(p1, 36420);
        assert_eq!(p1, p2);

        let p3 = store.get_or_create_pair_port(1, 3, 36420).await.unwrap();
        assert_eq!(p3, 36421);
        assert_eq!(
            store.get_or_create_pair_port(1, 2, 36420).await.unwrap(),
            36420
        );
    }

    #[tokio::test]
    async fn pair_port_rejects_self_pair() {
        let store = MemoryStore::new();
        let err = store.get_or_create_pair_port(4, 4, 36420).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn delete_node_cascades() {
        let store = MemoryStore::new();
        let a = store.create_node(new_node("a")).await.unwrap();
        let b = store.create_node(new_node("b")).await.unwrap();
        store
            .get_or_create_pair_port(a.id, b.id, 36420)
            .await
            .unwrap();
        store
            .upsert_node_status(
                a.id,
                StatusSnapshot {
                    node_id: a.id,
                    hostname: "h".into(),
                    ip_address: String::new(),
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    disk_percent: 0.0,
                    uptime_secs: 0,
                    active_tasks: vec![],
                    status: "ok".into(),
                    version: String::new(),
                    reported_at: 0,
                },
            )
            .await
            .unwrap();

        store.delete_node(a.id).await.unwrap();

        assert!(store.list_pair_ports().await.unwrap().is_empty());
        assert!(store.get_node_status(a.id).await.is_err());
    }

    #[tokio::test]
    async fn task_filtering() {
        let store = MemoryStore::new();
        for (id, node_id, status) in [
            ("config_update_1", 1, TaskStatus::Pending),
            ("config_update_2", 2, TaskStatus::Success),
        ] {
            store
                .create_task(Task {
                    id: id.into(),
                    kind: TaskKind::ConfigUpdate,
                    node_id,
                    status,
                    error: None,
                    created_at: 0,
                    started_at: None,
                    completed_at: None,
                })
                .await
                .unwrap();
        }

        let pending = store
            .list_tasks(TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].node_id, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_tasks() {
        let store = MemoryStore::new();
        let now = unix_timestamp();
        for (id, status, completed_at) in [
            ("config_update_old", TaskStatus::Success, Some(now - 100_000)),
            ("config_update_new", TaskStatus::Success, Some(now)),
            ("config_update_pending", TaskStatus::Pending, None),
        ] {
            store
                .create_task(Task {
                    id: id.into(),
                    kind: TaskKind::ConfigUpdate,
                    node_id: 1,
                    status,
                    error: None,
                    created_at: now,
                    started_at: None,
                    completed_at,
                })
                .await
                .unwrap();
        }

        let removed = store.cleanup_tasks(24 * 3600).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_task("config_update_old").await.is_err());
        assert!(store.get_task("config_update_new").await.is_ok());
        assert!(store.get_task("config_update_pending").await.is_ok());
    }
}
