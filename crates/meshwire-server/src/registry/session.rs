//! In-memory session registry for node task streams.
//!
//! One record per registered node: the cached token, a last-seen instant,
//! and the currently bound outbound task stream. The registry map is
//! guarded by a readers-writer lock that is always released before the
//! per-session stream mutex is touched, so sending to node X never
//! blocks sending to node Y.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use meshwire_proto::v1::TaskFrame;

use crate::error::ServerError;

/// Outbound frame sender bound to a node's subscription stream.
pub type TaskSender = mpsc::Sender<Result<TaskFrame, tonic::Status>>;

/// Session record for one registered node.
pub struct NodeSession {
    pub node_id: i64,
    token: String,
    last_seen: RwLock<Instant>,
    /// The bound stream, if any. The mutex is held across the single
    /// send on purpose: it is the per-session write lock.
    stream: Mutex<Option<TaskSender>>,
}

impl NodeSession {
    fn new(node_id: i64, token: String) -> Self {
        Self {
            node_id,
            token,
            last_seen: RwLock::new(Instant::now()),
            stream: Mutex::new(None),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn last_seen(&self) -> Instant {
        *self.last_seen.read().await
    }

    async fn touch(&self) {
        *self.last_seen.write().await = Instant::now();
    }
}

/// Thread-safe registry of node sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<i64, Arc<NodeSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the session record for a node. The caller has
    /// already verified the token.
    pub async fn register(&self, node_id: i64, token: String) {
        let session = Arc::new(NodeSession::new(node_id, token));
        self.sessions.write().await.insert(node_id, session);
        info!(node_id, "Node session registered");
    }

    pub async fn get(&self, node_id: i64) -> Option<Arc<NodeSession>> {
        self.sessions.read().await.get(&node_id).cloned()
    }

    /// Bind a subscription stream to a registered node.
    ///
    /// A second bind supersedes the first: dropping the previous sender
    /// ends the superseded subscription, whose client observes end of
    /// stream and drains.
    pub async fn bind_stream(&self, node_id: i64, sender: TaskSender) -> Result<(), ServerError> {
        let session = self
            .get(node_id)
            .await
            .ok_or_else(|| ServerError::NotFound(format!("node {node_id} not registered")))?;

        let mut stream = session.stream.lock().await;
        if let Some(old) = stream.take() {
            // Terminate the superseded subscription so its holder
            // observes cancellation and drains instead of hanging.
            let _ = old.try_send(Err(tonic::Status::cancelled(
                "superseded by a new subscription",
            )));
            info!(node_id, "Superseding existing task stream");
        }
        *stream = Some(sender);
        drop(stream);

        session.touch().await;
        Ok(())
    }

    /// Clear the bound stream only if `sender` is still the one bound;
    /// a superseded stream unbinding late must not evict its successor.
    pub async fn unbind_stream(&self, node_id: i64, sender: &TaskSender) {
        let Some(session) = self.get(node_id).await else {
            return;
        };
        let mut stream = session.stream.lock().await;
        if stream
            .as_ref()
            .is_some_and(|bound| bound.same_channel(sender))
        {
            *stream = None;
            info!(node_id, "Task stream unbound");
        }
    }

    /// Refresh last-seen after any authenticated call from the node.
    pub async fn touch(&self, node_id: i64) {
        if let Some(session) = self.get(node_id).await {
            session.touch().await;
        }
    }

    /// Write one frame on the node's bound stream.
    pub async fn send(&self, node_id: i64, frame: TaskFrame) -> Result<(), ServerError> {
        let session = self
            .get(node_id)
            .await
            .ok_or_else(|| ServerError::Unavailable(format!("node {node_id} has no session")))?;

        let mut stream = session.stream.lock().await;
        let Some(sender) = stream.as_ref() else {
            return Err(ServerError::Unavailable(format!(
                "node {node_id} has no bound stream"
            )));
        };

        if sender.send(Ok(frame)).await.is_err() {
            // Receiver dropped without an unbind; clear the dead stream.
            warn!(node_id, "Task stream closed mid-send");
            *stream = None;
            return Err(ServerError::Unavailable(format!(
                "node {node_id} stream closed"
            )));
        }
        Ok(())
    }

    /// Whether the node currently has a bound stream.
    pub async fn is_online(&self, node_id: i64) -> bool {
        match self.get(node_id).await {
            Some(session) => session.stream.lock().await.is_some(),
            None => false,
        }
    }

    /// Drop the session entirely (node deleted).
    pub async fn remove(&self, node_id: i64) {
        if self.sessions.write().await.remove(&node_id).is_some() {
            info!(node_id, "Node session removed");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
