//! Durable registry of nodes, pair-port bindings, tasks, status, users.
//!
//! Two interchangeable backends: an in-memory store for tests and a
//! SQLite store for production. Both live behind the `Store` trait;
//! services hold an `Arc<dyn Store>` and never know which one they got.

mod memory;
mod models;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use meshwire_core::config::{StorageConfig, StorageKind};
use thiserror::Error;

pub use memory::MemoryStore;
pub use models::{
    NewNode, Node, NodeUpdate, PairPort, StatusSnapshot, Task, TaskFilter, TaskKind, TaskStatus,
    User,
};
pub use sqlite::SqliteStore;

/// Typed store failures. Callers translate these at the transport
/// boundary: not-found to 404 / NOT_FOUND, conflict to 409 /
/// ALREADY_EXISTS, the rest to 500 / INTERNAL.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store reported an impossible state (e.g. the pair-port space
    /// is exhausted). Surfaced to the operator, never swallowed.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return Self::Conflict(db.to_string());
            }
            if db.is_check_violation() {
                return Self::Integrity(db.to_string());
            }
        }
        Self::Backend(e.to_string())
    }
}

/// The coordinator's storage contract.
#[async_trait]
pub trait Store: Send + Sync {
    // --- nodes ---
    async fn create_node(&self, node: NewNode) -> Result<Node, StoreError>;
    async fn get_node(&self, id: i64) -> Result<Node, StoreError>;
    /// Ordered by identifier; the generator relies on this for
    /// deterministic rendering.
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
    async fn update_node(&self, id: i64, update: NodeUpdate) -> Result<Node, StoreError>;
    /// Cascades to pair bindings and status rows.
    async fn delete_node(&self, id: i64) -> Result<(), StoreError>;

    // --- pair ports ---
    /// Return the existing port for the unordered pair `{a, b}` or
    /// allocate a new one. The scan, the decision, and the insert are a
    /// single atomic step; see the pair allocator notes on each backend.
    async fn get_or_create_pair_port(
        &self,
        a: i64,
        b: i64,
        base_port: u16,
    ) -> Result<u16, StoreError>;
    async fn list_pair_ports(&self) -> Result<Vec<PairPort>, StoreError>;

    // --- tasks ---
    async fn create_task(&self, task: Task) -> Result<(), StoreError>;
    async fn get_task(&self, id: &str) -> Result<Task, StoreError>;
    async fn update_task(&self, task: Task) -> Result<(), StoreError>;
    async fn delete_task(&self, id: &str) -> Result<(), StoreError>;
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;
    /// Delete terminal tasks whose completion timestamp is older than the
    /// retention window. Returns the number of rows removed.
    async fn cleanup_tasks(&self, older_than_secs: i64) -> Result<u64, StoreError>;

    // --- node status ---
    async fn upsert_node_status(&self, id: i64, status: StatusSnapshot) -> Result<(), StoreError>;
    async fn get_node_status(&self, id: i64) -> Result<StatusSnapshot, StoreError>;
    async fn list_node_status(&self) -> Result<Vec<StatusSnapshot>, StoreError>;

    // --- users ---
    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError>;
    async fn get_user_by_username(&self, username: &str) -> Result<User, StoreError>;
    async fn user_exists(&self, username: &str) -> Result<bool, StoreError>;

    /// Release all handles.
    async fn close(&self);
}

/// Build a store from the configuration.
pub async fn open_store(cfg: &StorageConfig) -> Result<Arc<dyn Store>, StoreError> {
    match cfg.kind {
        StorageKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageKind::Sqlite => Ok(Arc::new(SqliteStore::open(&cfg.sqlite.path).await?)),
        StorageKind::Postgres => Err(StoreError::Backend(
            "postgres storage not implemented".into(),
        )),
    }
}
