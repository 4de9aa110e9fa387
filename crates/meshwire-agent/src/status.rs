//! The 30-second status loop.
//!
//! Each tick collects host metrics, pushes a status snapshot, and sends
//! a heartbeat so the coordinator's last-seen stays fresh even when no
//! tasks flow. Both RPCs carry a 5-second deadline; failures are logged
//! and the loop keeps going; the next tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tonic::transport::Channel;
use tracing::{debug, warn};

use meshwire_core::config::AgentConfig;
use meshwire_core::db::unix_timestamp;
use meshwire_proto::v1::status_service_client::StatusServiceClient;
use meshwire_proto::v1::task_service_client::TaskServiceClient;
use meshwire_proto::v1::{HeartbeatRequest, StatusReport, StatusSnapshot};

use crate::metrics::MetricsSource;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);
const PUSH_DEADLINE: Duration = Duration::from_secs(5);

pub struct StatusReporter {
    config: AgentConfig,
    status_client: StatusServiceClient<Channel>,
    task_client: TaskServiceClient<Channel>,
    metrics: Box<dyn MetricsSource>,
    active_tasks: Arc<Mutex<Vec<String>>>,
}

impl StatusReporter {
    pub fn new(
        config: AgentConfig,
        channel: Channel,
        metrics: Box<dyn MetricsSource>,
        active_tasks: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            config,
            status_client: StatusServiceClient::new(channel.clone()),
            task_client: TaskServiceClient::new(channel),
            metrics,
            active_tasks,
        }
    }

    /// Report every 30 seconds until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.push_once().await;
                    self.heartbeat().await;
                }
                _ = shutdown.changed() => {
                    debug!("Status reporter shutting down");
                    return;
                }
            }
        }
    }

    /// Build and push one snapshot.
    pub async fn push_once(&mut self) {
        let sample = self.metrics.collect();
        let active = self.active_tasks.lock().await.clone();

        let snapshot = StatusSnapshot {
            node_id: self.config.node_id,
            hostname: sample.hostname,
            // Left empty; the coordinator records the observed address.
            ip_address: String::new(),
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            disk_percent: sample.disk_percent,
            uptime_secs: sample.uptime_secs,
            active_tasks: active,
            status: "running".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            reported_at: unix_timestamp(),
        };

        let mut request = tonic::Request::new(StatusReport {
            node_id: self.config.node_id,
            token: self.config.token.clone(),
            status: Some(snapshot),
        });
        request.set_timeout(PUSH_DEADLINE);

        match self.status_client.report_status(request).await {
            Ok(_) => debug!(node_id = self.config.node_id, "Status pushed"),
            Err(e) => warn!(error = %e, "Status push failed"),
        }
    }

    async fn heartbeat(&mut self) {
        let mut request = tonic::Request::new(HeartbeatRequest {
            node_id: self.config.node_id,
            token: self.config.token.clone(),
        });
        request.set_timeout(PUSH_DEADLINE);

        if let Err(e) = self.task_client.heartbeat(request).await {
            warn!(error = %e, "Heartbeat failed");
        }
    }
}
