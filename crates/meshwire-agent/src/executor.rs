//! Task execution on the agent host.
//!
//! A configuration update is: fetch the rendered bundle over HTTP,
//! write each peer's WireGuard config atomically, restart the matching
//! wg-quick unit, write the babeld config, restart babeld. Every write
//! goes through a temp file in the target directory so a crash never
//! leaves a half-written config behind. In dry-run mode the intended
//! actions are logged and nothing is executed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::{error, info, warn};

use meshwire_core::bundle::ConfigBundle;
use meshwire_core::config::AgentConfig;
use meshwire_proto::v1::task_service_client::TaskServiceClient;
use meshwire_proto::v1::{TaskFrame, UpdateTaskStatusRequest};

/// Per-push deadline for status report RPCs.
const REPORT_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for the HTTP config fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Config fetch failed: {0}")]
    Fetch(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Service restart failed: {0}")]
    Restart(String),

    #[error("Unknown task kind: {0}")]
    UnknownKind(String),
}

pub struct TaskExecutor {
    config: AgentConfig,
    http: reqwest::Client,
    tasks: TaskServiceClient<Channel>,
    /// Task ids currently executing; mirrored into status snapshots.
    active: Arc<Mutex<Vec<String>>>,
}

impl TaskExecutor {
    pub fn new(config: AgentConfig, channel: Channel) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            config,
            http,
            tasks: TaskServiceClient::new(channel),
            active: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the currently-executing task ids.
    pub fn active_tasks(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.active)
    }

    /// Execute one task frame and report its terminal state.
    pub async fn execute(&self, frame: TaskFrame) {
        info!(task_id = %frame.task_id, kind = %frame.kind, "Processing task");

        self.active.lock().await.push(frame.task_id.clone());
        self.report(&frame.task_id, "running", "").await;

        let result = match frame.kind.as_str() {
            "config_update" => self.apply_config_update().await,
            // Status is pushed on its own 30-second loop; the task is
            // just a nudge and succeeds trivially.
            "status_report" => Ok(()),
            other => Err(ExecutorError::UnknownKind(other.to_string())),
        };

        match &result {
            Ok(()) => {
                info!(task_id = %frame.task_id, "Task completed");
                self.report(&frame.task_id, "success", "").await;
            }
            Err(e) => {
                error!(task_id = %frame.task_id, error = %e, "Task failed");
                self.report(&frame.task_id, "failed", &e.to_string()).await;
            }
        }

        self.active.lock().await.retain(|id| id != &frame.task_id);
    }

    /// Fetch the rendered bundle and materialize it on disk.
    async fn apply_config_update(&self) -> Result<(), ExecutorError> {
        let bundle = self.fetch_bundle().await?;
        let prefix = &self.config.wireguard.prefix;

        for (peer_name, text) in &bundle.wireguard {
            let file_name = format!("{prefix}{peer_name}.conf");
            let path = self.config.wireguard.config_path.join(&file_name);
            self.write_atomic(&path, text, 0o600)?;
            self.restart_unit(&format!("wg-quick@{prefix}{peer_name}"))
                .await?;
        }

        let babel_text = bundle.babel.replace("{WGPrefix}", prefix);
        self.write_atomic(&self.config.babel.config_path, &babel_text, 0o644)?;
        self.restart_unit("babeld").await?;

        info!(peers = bundle.wireguard.len(), "Configuration applied");
        Ok(())
    }

    async fn fetch_bundle(&self) -> Result<ConfigBundle, ExecutorError> {
        let url = format!(
            "{}/api/agent/config/{}",
            self.config.server.address.trim_end_matches('/'),
            self.config.node_id
        );

        let response = self
            .http
            .get(&url)
            .basic_auth(self.config.node_id, Some(&self.config.token))
            .send()
            .await
            .map_err(|e| ExecutorError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecutorError::Fetch(format!(
                "unexpected status {} from {url}",
                response.status()
            )));
        }

        response
            .json::<ConfigBundle>()
            .await
            .map_err(|e| ExecutorError::Fetch(format!("decoding bundle: {e}")))
    }

    /// Write via a temp file in the target directory, then rename.
    fn write_atomic(&self, path: &Path, contents: &str, mode: u32) -> Result<(), ExecutorError> {
        if self.config.runtime.dry_run {
            info!(path = %path.display(), mode, "Dry run: would write config");
            return Ok(());
        }

        let dir = path
            .parent()
            .ok_or_else(|| ExecutorError::Io(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| ExecutorError::Io(e.to_string()))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| ExecutorError::Io(e.to_string()))?;
        std::io::Write::write_all(&mut tmp, contents.as_bytes())
            .map_err(|e| ExecutorError::Io(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(mode))
                .map_err(|e| ExecutorError::Io(e.to_string()))?;
        }

        tmp.persist(path)
            .map_err(|e| ExecutorError::Io(e.to_string()))?;

        info!(path = %path.display(), "Config written");
        Ok(())
    }

    async fn restart_unit(&self, unit: &str) -> Result<(), ExecutorError> {
        if self.config.runtime.dry_run {
            info!(unit, "Dry run: would run systemctl restart");
            return Ok(());
        }

        let status = tokio::process::Command::new("systemctl")
            .args(["restart", unit])
            .status()
            .await
            .map_err(|e| ExecutorError::Restart(format!("{unit}: {e}")))?;

        if !status.success() {
            return Err(ExecutorError::Restart(format!(
                "systemctl restart {unit} exited with {status}"
            )));
        }

        info!(unit, "Service restarted");
        Ok(())
    }

    /// Report a task state transition; failures are logged, not fatal,
    /// since the coordinator keeps the task row either way.
    async fn report(&self, task_id: &str, status: &str, error: &str) {
        let mut request = tonic::Request::new(UpdateTaskStatusRequest {
            task_id: task_id.to_string(),
            status: status.to_string(),
            error: error.to_string(),
        });
        request.set_timeout(REPORT_DEADLINE);

        if let Err(e) = self.tasks.clone().update_task_status(request).await {
            warn!(task_id, status, error = %e, "Failed to report task status");
        }
    }
}
