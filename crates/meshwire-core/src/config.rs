//! Configuration for the Meshwire coordinator and agent.
//!
//! Both binaries read a tree-structured YAML file. Every section has
//! compiled-in defaults so a minimal file only needs to override what
//! differs; `validate()` catches the handful of options that have no
//! sensible default (JWT secret, node token).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =========================================================================
// Server configuration
// =========================================================================

/// Complete coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: TlsConfig::default(),
            jwt: JwtConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JwtConfig {
    pub secret_key: String,
}

/// Mesh addressing and port allocation parameters.
///
/// The address templates use `{node}` / `{peer}` placeholders substituted
/// with decimal node identifiers; the IPv6 variants use `{node:x}` /
/// `{peer:x}` substituted with lowercase hex. The two forms are not
/// interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// First UDP port handed out by the pair allocator.
    pub base_port: u16,
    pub ipv4_range: String,
    /// Point-to-point IPv4 address for the local end of a tunnel.
    pub ipv4_template: String,
    /// Per-node IPv4 address routed behind a member (babel redistributes it).
    pub ipv4_node_template: String,
    pub ipv6_range: String,
    pub ipv6_template: String,
    pub ipv6_node_template: String,
    pub link_local_template: String,
    pub link_local_net: String,
    pub babel_multicast: String,
    pub babel_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_port: 36420,
            ipv4_range: "10.42.0.0/16".to_string(),
            ipv4_template: "10.42.{node}.{peer}/32".to_string(),
            ipv4_node_template: "10.42.{node}.0/32".to_string(),
            ipv6_range: "2a13:a5c7:21ff::/48".to_string(),
            ipv6_template: "2a13:a5c7:21ff:{node:x}::{peer:x}/128".to_string(),
            ipv6_node_template: "2a13:a5c7:21ff:{node:x}::/80".to_string(),
            link_local_template: "fe80::{node}:{peer}/64".to_string(),
            link_local_net: "fe80::/64".to_string(),
            babel_multicast: "ff02::1:6/128".to_string(),
            babel_port: 6696,
        }
    }
}

/// Config file templates with `{{ .FieldName }}` placeholders.
///
/// The recognized placeholder set is fixed; see the generator module for
/// the full list per template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    pub wireguard: String,
    pub babel: String,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            wireguard: DEFAULT_WIREGUARD_TEMPLATE.to_string(),
            babel: DEFAULT_BABEL_TEMPLATE.to_string(),
        }
    }
}

/// One WireGuard config file per ordered (node, peer) pair.
pub const DEFAULT_WIREGUARD_TEMPLATE: &str = r"# WireGuard mesh link: node {{ .NodeID }} -> peer {{ .Peer.ID }}
[Interface]
Address = {{ .LinkLocal }}
Address = {{ .IPv4Address }}, {{ .IPv6Address }}
PrivateKey = {{ .PrivateKey }}
ListenPort = {{ .ListenPort }}
MTU = {{ .MTU }}
Table = off

[Peer]
PublicKey = {{ .Peer.PublicKey }}
Endpoint = {{ .Peer.Endpoint }}
AllowedIPs = {{ .Peer.AllowedIPs }}
AllowedIPs = {{ .LinkLocalNet }}, {{ .BabelMulticast }}
PersistentKeepalive = 25
";

/// The `{WGPrefix}` marker inside interface lines is substituted by the
/// agent with its local interface prefix before the file is written.
pub const DEFAULT_BABEL_TEMPLATE: &str = r"# babeld config for node {{ .NodeID }}
local-port {{ .Port }}
update-interval {{ .UpdateInterval }}
random-id true
link-detect true

{{ .Interfaces }}

{{ .IPv4Routes }}
{{ .IPv6Routes }}
";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    pub debug: bool,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Sqlite,
            sqlite: SqliteConfig::default(),
            postgres: PostgresConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/meshwire.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub sslmode: String,
}

impl ServerConfig {
    /// Load and validate a server config file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = load_yaml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(Error::Config("server.host is required".into()));
        }
        if self.server.port == 0 {
            return Err(Error::Config("invalid server.port: 0".into()));
        }
        if self.server.jwt.secret_key.is_empty() {
            return Err(Error::Config("server.jwt.secret_key is required".into()));
        }
        if self.server.tls.enabled {
            // TLS termination happens in front of the combined listener.
            return Err(Error::Config(
                "server.tls: terminate TLS at a fronting proxy; \
                 the combined gRPC/HTTP listener serves plaintext"
                    .into(),
            ));
        }
        if self.network.base_port == 0 {
            return Err(Error::Config("invalid network.base_port: 0".into()));
        }
        if self.network.ipv4_range.is_empty() {
            return Err(Error::Config("network.ipv4_range is required".into()));
        }
        if self.network.ipv6_range.is_empty() {
            return Err(Error::Config("network.ipv6_range is required".into()));
        }
        for (name, tpl, marker) in [
            ("network.ipv4_template", &self.network.ipv4_template, "{node}"),
            (
                "network.ipv4_node_template",
                &self.network.ipv4_node_template,
                "{node}",
            ),
            ("network.ipv6_template", &self.network.ipv6_template, "{node:x}"),
            (
                "network.ipv6_node_template",
                &self.network.ipv6_node_template,
                "{node:x}",
            ),
        ] {
            if !tpl.contains(marker) {
                return Err(Error::Config(format!(
                    "{name} must contain the {marker} placeholder"
                )));
            }
        }
        Ok(())
    }

    /// Socket address string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

// =========================================================================
// Agent configuration
// =========================================================================

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Identifier of the node this agent runs on.
    pub node_id: i64,
    /// Authentication token issued at node creation.
    pub token: String,
    #[serde(default)]
    pub server: AgentServerConfig,
    #[serde(default)]
    pub wireguard: WireguardPaths,
    #[serde(default)]
    pub babel: BabelPaths,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServerConfig {
    /// HTTP base URL for config fetches (e.g. `http://mesh.example.net:8080`).
    pub address: String,
    /// gRPC endpoint URL; defaults to `address` when empty.
    #[serde(default)]
    pub grpc_address: String,
    #[serde(default)]
    pub tls: AgentTlsConfig,
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8080".to_string(),
            grpc_address: String::new(),
            tls: AgentTlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentTlsConfig {
    pub enabled: bool,
    pub ca_cert: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardPaths {
    /// Directory the per-peer config files are written into.
    pub config_path: PathBuf,
    /// Interface name prefix, e.g. `wg-`.
    pub prefix: String,
}

impl Default for WireguardPaths {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/wireguard"),
            prefix: "wg-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BabelPaths {
    pub config_path: PathBuf,
    pub bin_path: PathBuf,
}

impl Default for BabelPaths {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/babeld.conf"),
            bin_path: PathBuf::from("/usr/sbin/babeld"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub log_path: Option<PathBuf>,
    pub log_level: String,
    /// Log intended actions instead of writing files or restarting units.
    pub dry_run: bool,
    pub metrics_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            log_level: "info".to_string(),
            dry_run: false,
            metrics_port: 0,
        }
    }
}

impl AgentConfig {
    /// Load and validate an agent config file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = load_yaml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id <= 0 {
            return Err(Error::Config(format!("invalid node_id: {}", self.node_id)));
        }
        if self.token.is_empty() {
            return Err(Error::Config("token is required".into()));
        }
        if self.server.address.is_empty() {
            return Err(Error::Config("server.address is required".into()));
        }
        Ok(())
    }

    /// gRPC endpoint URL, falling back to the HTTP address.
    pub fn grpc_address(&self) -> &str {
        if self.server.grpc_address.is_empty() {
            &self.server.address
        } else {
            &self.server.grpc_address
        }
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        Error::Config(format!("failed to parse config file {}: {e}", path.display()))
    })
}
