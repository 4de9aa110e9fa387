//! The status hub: accept agent reports, persist, stream to dashboards.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::storage::{StatusSnapshot, Store};

/// Buffered snapshots per subscriber before backpressure applies.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Clone)]
pub struct StatusHub {
    store: Arc<dyn Store>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<StatusSnapshot>>>>,
}

impl StatusHub {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Persist a snapshot (overwriting the previous one for the node)
    /// and fan it out to every live subscriber.
    pub async fn report(&self, node_id: i64, snapshot: StatusSnapshot) -> Result<()> {
        self.store
            .upsert_node_status(node_id, snapshot.clone())
            .await?;

        let mut any_dead = false;
        {
            let subscribers = self.subscribers.read().await;
            for sub in subscribers.iter() {
                if sub.send(snapshot.clone()).await.is_err() {
                    any_dead = true;
                }
            }
        }
        if any_dead {
            self.subscribers.write().await.retain(|s| !s.is_closed());
        }

        debug!(node_id, "Status snapshot stored and fanned out");
        Ok(())
    }

    /// Subscribe to status updates. The receiver is seeded with the
    /// current snapshot of every known node, then gets live updates
    /// until it is dropped.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<StatusSnapshot>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        for snapshot in self.store.list_node_status().await? {
            // The fresh receiver cannot be closed yet; a full buffer
            // here means an absurdly large fleet, which we let error.
            let _ = tx.send(snapshot).await;
        }

        self.subscribers.write().await.push(tx);
        Ok(rx)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn snapshot(node_id: i64, cpu: f64) -> StatusSnapshot {
        StatusSnapshot {
            node_id,
            hostname: format!("host-{node_id}"),
            ip_address: String::new(),
            cpu_percent: cpu,
            memory_percent: 0.0,
            disk_percent: 0.0,
            uptime_secs: 0,
            active_tasks: vec![],
            status: "ok".into(),
            version: "0.3.0".into(),
            reported_at: 0,
        }
    }

    #[tokio::test]
    async fn report_persists_and_overwrites() {
        let store = Arc::new(MemoryStore::new());
        let hub = StatusHub::new(store.clone());

        hub.report(1, snapshot(1, 10.0)).await.unwrap();
        hub.report(1, snapshot(1, 20.0)).await.unwrap();

        let stored = store.get_node_status(1).await.unwrap();
        assert_eq!(stored.cpu_percent, 20.0);
        assert_eq!(store.list_node_status().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscriber_gets_current_state_then_updates() {
        let store = Arc::new(MemoryStore::new());
        let hub = StatusHub::new(store);

        hub.report(1, snapshot(1, 10.0)).await.unwrap();

        let mut rx = hub.subscribe().await.unwrap();
        let seeded = rx.recv().await.unwrap();
        assert_eq!(seeded.node_id, 1);

        hub.report(2, snapshot(2, 5.0)).await.unwrap();
        let live = rx.recv().await.unwrap();
        assert_eq!(live.node_id, 2);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let store = Arc::new(MemoryStore::new());
        let hub = StatusHub::new(store);

        let rx = hub.subscribe().await.unwrap();
        assert_eq!(hub.subscriber_count().await, 1);
        drop(rx);

        hub.report(1, snapshot(1, 1.0)).await.unwrap();
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
