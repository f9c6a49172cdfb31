//! sqlmux Configuration
//!
//! This module provides the configuration document for the proxy: global
//! listener settings, the clusters (one master plus ordered slaves) and the
//! users allowed to connect. A parsed and validated [`ProxyConfig`] is an
//! immutable snapshot; see [`crate::reload`] for publishing replacements.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Process-wide settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Clusters by name
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,

    /// Users by name
    #[serde(default)]
    pub users: HashMap<String, UserConfig>,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Host to bind the client listener and management API on
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Client listener port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Management API port
    #[serde(default = "default_manage_port")]
    pub manage_port: u16,

    /// Maximum concurrent client sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log to file path (optional)
    #[serde(default)]
    pub log_filename: Option<PathBuf>,

    /// Idle client timeout in seconds
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,

    /// Backend I/O timeout in seconds
    #[serde(default = "default_server_timeout")]
    pub server_timeout: u64,

    /// Watch the config file and hot-reload it
    #[serde(default = "default_true")]
    pub conf_autoload: bool,

    /// Seconds between config file modification checks
    #[serde(default = "default_reload_interval")]
    pub conf_reload_interval: u64,

    /// IPs allowed to use the management API
    #[serde(default = "default_auth_ips")]
    pub auth_ips: Vec<String>,

    /// Charset every pooled backend connection is reset to before reuse
    #[serde(default = "default_charset")]
    pub default_charset: String,
}

/// One master plus ordered replicas
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    /// Master node (required by validation)
    #[serde(default)]
    pub master: Option<NodeConfig>,

    /// Replica nodes, in configured order
    #[serde(default)]
    pub slaves: Vec<NodeConfig>,
}

/// A physical database node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Node host
    pub host: String,

    /// Node port
    #[serde(default = "default_node_port")]
    pub port: u16,

    /// Backend username
    pub username: String,

    /// Backend password
    #[serde(default)]
    pub password: String,

    /// Default schema for backend connections
    #[serde(default)]
    pub db_name: String,

    /// Routing weight (reserved for replica selection)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Maximum backend connections to this node
    #[serde(default = "default_node_max_connections")]
    pub max_connections: usize,

    /// Maximum idle connections per pool shard (0 disables idle pooling)
    #[serde(default = "default_pool_size")]
    pub max_connection_pool_size: usize,

    /// Dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds between reconnect attempts to a failed node
    #[serde(default = "default_reconnect_interval")]
    pub time_reconnect_interval: u64,
}

/// A client user
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    /// Username (filled from the table key when omitted)
    #[serde(default)]
    pub username: String,

    /// Client password
    #[serde(default)]
    pub password: String,

    /// Schema the password authorizes
    #[serde(default)]
    pub db_name: String,

    /// Client charset
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Maximum concurrent sessions for this user
    #[serde(default)]
    pub max_connections: usize,

    /// Minimum warm backend connections for this user
    #[serde(default)]
    pub min_connections: usize,

    /// Cluster serving this user
    pub cluster_name: String,

    /// Client IPs allowed to log in (empty allows all)
    #[serde(default)]
    pub auth_ips: Vec<String>,

    /// Client IPs always rejected
    #[serde(default)]
    pub black_list_ips: Vec<String>,
}

// Default value functions
fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_manage_port() -> u16 {
    3307
}

fn default_max_connections() -> usize {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_client_timeout() -> u64 {
    1800
}

fn default_server_timeout() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

fn default_reload_interval() -> u64 {
    60
}

fn default_auth_ips() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_charset() -> String {
    "utf8".to_string()
}

fn default_node_port() -> u16 {
    3306
}

fn default_weight() -> u32 {
    1
}

fn default_node_max_connections() -> usize {
    1000
}

fn default_pool_size() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_reconnect_interval() -> u64 {
    10
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            port: default_port(),
            manage_port: default_manage_port(),
            max_connections: default_max_connections(),
            log_level: default_log_level(),
            log_filename: None,
            client_timeout: default_client_timeout(),
            server_timeout: default_server_timeout(),
            conf_autoload: true,
            conf_reload_interval: default_reload_interval(),
            auth_ips: default_auth_ips(),
            default_charset: default_charset(),
        }
    }
}

impl GlobalConfig {
    /// Client listener address
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.port)
    }

    /// Management API address
    pub fn manage_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.manage_port)
    }

    /// Get client idle timeout as Duration
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    /// Get backend I/O timeout as Duration
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout)
    }

    /// Get reload polling interval as Duration
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.conf_reload_interval.max(1))
    }
}

impl NodeConfig {
    /// Dial address (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Identity of the node for pool bookkeeping
    pub fn key(&self) -> String {
        format!("{}@{}:{}/{}", self.username, self.host, self.port, self.db_name)
    }

    /// Get dial timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let mut config: ProxyConfig = toml::from_str(content)?;
        for (name, user) in config.users.iter_mut() {
            if user.username.is_empty() {
                user.username = name.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.clusters.is_empty() {
            return Err(crate::Error::Config("at least one cluster is required".into()));
        }

        if self.users.is_empty() {
            return Err(crate::Error::Config("at least one user is required".into()));
        }

        for (name, user) in &self.users {
            if !self.clusters.contains_key(&user.cluster_name) {
                return Err(crate::Error::Config(format!(
                    "cluster {} of user {} does not exist",
                    user.cluster_name, name
                )));
            }
        }

        for (name, cluster) in &self.clusters {
            if cluster.master.is_none() {
                return Err(crate::Error::Config(format!(
                    "cluster {} has no master node",
                    name
                )));
            }
        }

        if self.global.default_charset.is_empty() {
            return Err(crate::Error::Config("global.default_charset cannot be empty".into()));
        }

        Ok(())
    }

    /// Master node of a cluster
    pub fn master_of(&self, cluster: &str) -> Option<&NodeConfig> {
        self.clusters.get(cluster)?.master.as_ref()
    }

    /// Slave nodes of a cluster, in configured order
    pub fn slaves_of(&self, cluster: &str) -> Option<&[NodeConfig]> {
        self.clusters.get(cluster).map(|c| c.slaves.as_slice())
    }

    /// User by login name
    pub fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users
            .get(name)
            .filter(|u| u.username == name)
            .or_else(|| self.users.values().find(|u| u.username == name))
    }

    /// Commented starter configuration written by `sqlmux init`
    pub fn sample() -> String {
        r#"# sqlmux configuration

[global]
listen_host = "0.0.0.0"
port = 3306
manage_port = 3307
max_connections = 2000
log_level = "info"
# log_filename = "/var/log/sqlmux/sqlmux.log"
client_timeout = 1800
server_timeout = 1800
conf_autoload = true
conf_reload_interval = 60
# Hosts allowed to use the management API
auth_ips = ["127.0.0.1"]
default_charset = "utf8"

[clusters.main.master]
host = "127.0.0.1"
port = 3306
username = "proxy"
password = "change-me"
db_name = "app"
max_connections = 1000
max_connection_pool_size = 16
connect_timeout = 5

# [[clusters.main.slaves]]
# host = "10.0.0.2"
# username = "proxy"
# password = "change-me"
# db_name = "app"

[users.app]
password = "change-me"
db_name = "app"
charset = "utf8"
cluster_name = "main"
min_connections = 0
auth_ips = []
black_list_ips = []
"#
        .to_string()
    }

    /// Every node referenced by any cluster
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.clusters
            .values()
            .flat_map(|c| c.master.iter().chain(c.slaves.iter()))
    }
}
