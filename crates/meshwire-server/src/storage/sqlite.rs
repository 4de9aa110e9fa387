//! SQLite store backend.
//!
//! Pool setup and timestamps come from meshwire-core; queries follow the
//! bind-and-fetch style throughout. Pair-port allocation is the one
//! operation with a serialization requirement, handled below.

use std::path::Path;

use async_trait::async_trait;
use meshwire_core::db::{open_pool, open_pool_in_memory, unix_timestamp};
use sqlx::{Pool, Sqlite};
use tokio::sync::Mutex;
use tracing::info;

use super::models::{
    NewNode, Node, NodeUpdate, PairPort, StatusSnapshot, Task, TaskFilter, TaskKind, TaskStatus,
    User,
};
use super::{Store, StoreError};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    /// Single-writer gate for pair-port allocation. The scan, decision,
    /// and insert must be one linearization point; the coordinator is the
    /// only writer, so an in-process lock around the transaction is that
    /// point.
    alloc_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open or create the database at the given path and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let pool = open_pool(path).await?;
        let store = Self {
            pool,
            alloc_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = open_pool_in_memory().await?;
        let store = Self {
            pool,
            alloc_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration: {e}")))?;
        info!("Store migrations complete");
        Ok(())
    }

    async fn fetch_node(&self, id: i64) -> Result<NodeRow, StoreError> {
        sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_node(&self, node: NewNode) -> Result<Node, StoreError> {
        let now = unix_timestamp();
        let endpoints = serde_json::to_string(&node.endpoints)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO nodes (id, name, token, public_key, private_key, endpoints, \
             ipv4, ipv6, mtu, babel_interval, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node.id)
        .bind(&node.name)
        .bind(&node.token)
        .bind(&node.public_key)
        .bind(&node.private_key)
        .bind(&endpoints)
        .bind(&node.ipv4)
        .bind(&node.ipv6)
        .bind(i64::from(node.mtu))
        .bind(i64::from(node.babel_interval))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match (StoreError::from(e), node.id) {
            (StoreError::Conflict(_), Some(id)) => {
                StoreError::Conflict(format!("node {id} already exists"))
            }
            (other, _) => other,
        })?;

        let id = node.id.unwrap_or_else(|| result.last_insert_rowid());
        self.get_node(id).await
    }

    async fn get_node(&self, id: i64) -> Result<Node, StoreError> {
        self.fetch_node(id).await?.try_into()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Node::try_from)
            .collect()
    }

    async fn update_node(&self, id: i64, update: NodeUpdate) -> Result<Node, StoreError> {
        let current: Node = self.fetch_node(id).await?.try_into()?;

        let name = update.name.unwrap_or(current.name);
        let endpoints = update.endpoints.unwrap_or(current.endpoints);
        let ipv4 = update.ipv4.unwrap_or(current.ipv4);
        let ipv6 = update.ipv6.unwrap_or(current.ipv6);
        let token = update.token.unwrap_or(current.token);
        let babel_interval = update.babel_interval.unwrap_or(current.babel_interval);
        let endpoints_json = serde_json::to_string(&endpoints)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            "UPDATE nodes SET name = ?, endpoints = ?, ipv4 = ?, ipv6 = ?, token = ?, \
             babel_interval = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&name)
        .bind(&endpoints_json)
        .bind(&ipv4)
        .bind(&ipv6)
        .bind(&token)
        .bind(i64::from(babel_interval))
        .bind(unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_node(id).await
    }

    async fn delete_node(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("node {id}")));
        }
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
        let (lo, hi) = (a.min(b), a.max(b));

        // Fast path: the binding usually exists already.
        if let Some((port,)) = sqlx::query_as::<_, (i64,)>(
            "SELECT port FROM wireguard_connections WHERE node_id = ? AND peer_id = ?",
        )
        .bind(lo)
        .bind(hi)
        .fetch_optional(&self.pool)
        .await?
        {
            return port_from_row(port);
        }

        let _guard = self.alloc_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // Re-check under the lock; a concurrent first request for the
        // same pair may have won.
        if let Some((port,)) = sqlx::query_as::<_, (i64,)>(
            "SELECT port FROM wireguard_connections WHERE node_id = ? AND peer_id = ?",
        )
        .bind(lo)
        .bind(hi)
        .fetch_optional(&mut *tx)
        .await?
        {
            return port_from_row(port);
        }

        let (max_port,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(port), 0) FROM wireguard_connections")
                .fetch_one(&mut *tx)
                .await?;

        let port = if max_port >= i64::from(base_port) {
            max_port + 1
        } else {
            i64::from(base_port)
        };
        if u16::try_from(port).is_err() {
            return Err(StoreError::Integrity("pair port space exhausted".into()));
        }

        sqlx::query("INSERT INTO wireguard_connections (node_id, peer_id, port) VALUES (?, ?, ?)")
            .bind(lo)
            .bind(hi)
            .bind(port)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        port_from_row(port)
    }

    async fn list_pair_ports(&self) -> Result<Vec<PairPort>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT node_id, peer_id, port FROM wireguard_connections ORDER BY node_id, peer_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(node_id, peer_id, port)| {
                Ok(PairPort {
                    node_id,
                    peer_id,
                    port: port_from_row(port)?,
                })
            })
            .collect()
    }

    async fn create_task(&self, task: Task) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tasks (id, kind, node_id, status, error, created_at, started_at, \
             completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(task.kind.as_str())
        .bind(task.node_id)
        .bind(task.status.as_str())
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?
            .try_into()
    }

    async fn update_task(&self, task: Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, error = ?, started_at = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(task.status.as_str())
        .bind(&task.error)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        // Three optional predicates; fetch by the cheap indexed ones and
        // finish the filter in memory.
        let rows = match (filter.node_id, filter.status) {
            (Some(node_id), _) => {
                sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks WHERE node_id = ? ORDER BY created_at",
                )
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(status)) => {
                sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY created_at",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter()
            .map(Task::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map(|tasks| tasks.into_iter().filter(|t| filter.matches(t)).collect())
    }

    async fn cleanup_tasks(&self, older_than_secs: i64) -> Result<u64, StoreError> {
        let cutoff = unix_timestamp() - older_than_secs;
        let result = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('success', 'failed', 'canceled') \
             AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_node_status(&self, id: i64, status: StatusSnapshot) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(&status).map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            "INSERT INTO node_status (node_id, payload, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(node_id) DO UPDATE SET payload = excluded.payload, \
             updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(&payload)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node_status(&self, id: i64) -> Result<StatusSnapshot, StoreError> {
        let (payload,): (String,) =
            sqlx::query_as("SELECT payload FROM node_status WHERE node_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("status for node {id}")))?;

        let snapshot: StatusSnapshot =
            serde_json::from_str(&payload).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(snapshot.rounded())
    }

    async fn list_node_status(&self) -> Result<Vec<StatusSnapshot>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM node_status ORDER BY node_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(payload,)| {
                serde_json::from_str::<StatusSnapshot>(&payload)
                    .map(StatusSnapshot::rounded)
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .collect()
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => {
                StoreError::Conflict(format!("username {username} already exists"))
            }
            other => other,
        })?;

        Ok(User {
            id: result.last_insert_rowid(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now,
        })
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE username = ?")
                .bind(username)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn port_from_row(port: i64) -> Result<u16, StoreError> {
    u16::try_from(port)
        .map_err(|_| StoreError::Integrity(format!("stored port {port} out of range")))
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: i64,
    name: String,
    token: String,
    public_key: String,
    private_key: String,
    endpoints: String,
    ipv4: String,
    ipv6: String,
    mtu: i64,
    babel_interval: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.id,
            name: row.name,
            token: row.token,
            public_key: row.public_key,
            private_key: row.private_key,
            endpoints: serde_json::from_str(&row.endpoints)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            ipv4: row.ipv4,
            ipv6: row.ipv6,
            mtu: u32::try_from(row.mtu)
                .map_err(|_| StoreError::Integrity(format!("stored mtu {} invalid", row.mtu)))?,
            babel_interval: u32::try_from(row.babel_interval).map_err(|_| {
                StoreError::Integrity(format!("stored interval {} invalid", row.babel_interval))
            })?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    kind: String,
    node_id: i64,
    status: String,
    error: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, StoreError> {
        Ok(Self {
            kind: TaskKind::parse(&row.kind)
                .ok_or_else(|| StoreError::Integrity(format!("stored kind {:?}", row.kind)))?,
            status: TaskStatus::parse(&row.status)
                .ok_or_else(|| StoreError::Integrity(format!("stored status {:?}", row.status)))?,
            id: row.id,
            node_id: row.node_id,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
