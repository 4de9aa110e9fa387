//! Data models for the coordinator store.

use serde::{Deserialize, Serialize};

/// A fleet member.
///
/// `token` and `private_key` never leave the coordinator except through
/// the node-creation response (token, exactly once) and the agent config
/// endpoint (private key, to the node itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub token: String,
    pub public_key: String,
    pub private_key: String,
    /// Reachable addresses, IPv4 or IPv6 literals, port-less.
    pub endpoints: Vec<String>,
    /// Per-node IPv4 address derived from the identifier at creation.
    pub ipv4: String,
    /// Per-node IPv6 address derived from the identifier at creation.
    pub ipv6: String,
    pub mtu: u32,
    /// babeld update interval in milliseconds.
    pub babel_interval: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for node creation. The store assigns the identifier when `id`
/// is `None` and rejects duplicates when it is fixed.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub id: Option<i64>,
    pub name: String,
    pub token: String,
    pub public_key: String,
    pub private_key: String,
    pub endpoints: Vec<String>,
    pub ipv4: String,
    pub ipv6: String,
    pub mtu: u32,
    pub babel_interval: u32,
}

/// Partial node update. `None` fields keep their stored value; in
/// particular the token survives every update that does not explicitly
/// replace it.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub endpoints: Option<Vec<String>>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub token: Option<String>,
    pub babel_interval: Option<u32>,
}

/// A pair-port binding: the shared UDP port both endpoints of an
/// unordered node pair listen on. Stored canonically with
/// `node_id < peer_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairPort {
    pub node_id: i64,
    pub peer_id: i64,
    pub port: u16,
}

/// Task kinds dispatched to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ConfigUpdate,
    StatusReport,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigUpdate => "config_update",
            Self::StatusReport => "status_report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config_update" => Some(Self::ConfigUpdate),
            "status_report" => Some(Self::StatusReport),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal states are final; no further transitions are accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work targeted at one node, persisted independent of
/// delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Kind prefix + monotonic timestamp, e.g. `config_update_17123...`.
    pub id: String,
    pub kind: TaskKind,
    pub node_id: i64,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Filter for task listings. `None` fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub node_id: Option<i64>,
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.node_id.is_none_or(|id| task.node_id == id)
            && self.kind.is_none_or(|k| task.kind == k)
            && self.status.is_none_or(|s| task.status == s)
    }
}

/// Latest observed health for a node; overwritten in place on each
/// report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub node_id: i64,
    pub hostname: String,
    /// Source address as observed by the coordinator.
    pub ip_address: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub uptime_secs: i64,
    pub active_tasks: Vec<String>,
    pub status: String,
    pub version: String,
    pub reported_at: i64,
}

impl StatusSnapshot {
    /// Percentages are rounded to two decimals on the read path.
    pub fn rounded(mut self) -> Self {
        self.cpu_percent = round2(self.cpu_percent);
        self.memory_percent = round2(self.memory_percent);
        self.disk_percent = round2(self.disk_percent);
        self
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// A dashboard account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: i64,
}
