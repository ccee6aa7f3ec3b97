//! GitScale Configuration
//!
//! This module provides configuration structures for the GitScale
//! replicating Git front end.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state::ReplicaNode;

/// Main GitScale configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitScaleConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Replica node set
    pub cluster: ClusterConfig,

    /// Which Git services are exposed
    #[serde(default)]
    pub services: ServicesConfig,

    /// Repository executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Resync policy
    #[serde(default)]
    pub resync: ResyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Replica node set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Repository directories, one per replica node
    pub nodes: Vec<PathBuf>,

    /// Node that answers ref advertisements (defaults to the first node)
    #[serde(default)]
    pub advertise_node: Option<PathBuf>,

    /// Node that serves upload-pack (defaults to the first node)
    #[serde(default)]
    pub upload_node: Option<PathBuf>,

    /// Node healed before each ref advertisement (defaults to the last node)
    #[serde(default)]
    pub resync_node: Option<PathBuf>,
}

/// Git service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Serve git-upload-pack (fetch/clone)
    #[serde(default = "default_true")]
    pub upload_pack: bool,

    /// Serve git-receive-pack (push)
    #[serde(default = "default_true")]
    pub receive_pack: bool,

    /// Extra KEY=VALUE entries passed to every executor invocation
    #[serde(default)]
    pub env: Vec<String>,
}

/// Repository executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Git binary to invoke
    #[serde(default = "default_git_binary")]
    pub git_binary: PathBuf,
}

/// Requests that run a resync check before being served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncTrigger {
    /// GET /info/refs heals `cluster.resync_node`
    Advertise,
    /// POST /git-upload-pack heals the upload node
    UploadPack,
    /// POST /git-receive-pack heals every node before replicating
    ReceivePack,
}

/// Resync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Time budget shared by all steps of one resync, in seconds
    #[serde(default = "default_resync_timeout_secs")]
    pub timeout_secs: u64,

    /// Requests that trigger an on-demand resync
    #[serde(default = "default_triggers")]
    pub triggers: Vec<ResyncTrigger>,

    /// Compare refs with the healthy peer before fetching
    #[serde(default = "default_true")]
    pub reconcile: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

fn default_resync_timeout_secs() -> u64 {
    30
}

fn default_triggers() -> Vec<ResyncTrigger> {
    vec![
        ResyncTrigger::Advertise,
        ResyncTrigger::UploadPack,
        ResyncTrigger::ReceivePack,
    ]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            upload_pack: true,
            receive_pack: true,
            env: Vec::new(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            git_binary: default_git_binary(),
        }
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_resync_timeout_secs(),
            triggers: default_triggers(),
            reconcile: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl GitScaleConfig {
    /// Build a configuration for the given nodes with every other section defaulted
    pub fn for_nodes(nodes: Vec<PathBuf>) -> Self {
        Self {
            server: ServerConfig::default(),
            cluster: ClusterConfig {
                nodes,
                advertise_node: None,
                upload_node: None,
                resync_node: None,
            },
            services: ServicesConfig::default(),
            executor: ExecutorConfig::default(),
            resync: ResyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: GitScaleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.bind_address.is_empty() {
            return Err(crate::Error::Config("server.bind_address cannot be empty".into()));
        }

        if self.cluster.nodes.is_empty() {
            return Err(crate::Error::Config("cluster.nodes cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.cluster.nodes {
            if node.as_os_str().is_empty() {
                return Err(crate::Error::Config("cluster.nodes contains an empty path".into()));
            }
            // Markers name peers by path and git resolves them from the healing node
            if !node.is_absolute() {
                return Err(crate::Error::Config(format!(
                    "cluster.nodes entry {} must be an absolute path",
                    node.display()
                )));
            }
            if !seen.insert(node) {
                return Err(crate::Error::Config(format!(
                    "cluster.nodes lists {} more than once",
                    node.display()
                )));
            }
        }

        for (key, node) in [
            ("cluster.advertise_node", &self.cluster.advertise_node),
            ("cluster.upload_node", &self.cluster.upload_node),
            ("cluster.resync_node", &self.cluster.resync_node),
        ] {
            if let Some(node) = node {
                if !seen.contains(node) {
                    return Err(crate::Error::Config(format!(
                        "{} ({}) is not listed in cluster.nodes",
                        key,
                        node.display()
                    )));
                }
            }
        }

        for entry in &self.services.env {
            if !entry.contains('=') || entry.starts_with('=') {
                return Err(crate::Error::Config(format!(
                    "services.env entry {:?} must look like KEY=VALUE",
                    entry
                )));
            }
        }

        if self.resync.timeout_secs == 0 {
            return Err(crate::Error::Config("resync.timeout_secs must be positive".into()));
        }

        Ok(())
    }

    /// The replica node set, in configuration order
    pub fn nodes(&self) -> Vec<ReplicaNode> {
        self.cluster.nodes.iter().map(ReplicaNode::new).collect()
    }

    /// Node answering ref advertisements
    pub fn advertise_node(&self) -> ReplicaNode {
        self.pick(self.cluster.advertise_node.as_ref(), self.cluster.nodes.first())
    }

    /// Node serving upload-pack
    pub fn upload_node(&self) -> ReplicaNode {
        self.pick(self.cluster.upload_node.as_ref(), self.cluster.nodes.first())
    }

    /// Node healed before ref advertisements
    pub fn resync_node(&self) -> ReplicaNode {
        self.pick(self.cluster.resync_node.as_ref(), self.cluster.nodes.last())
    }

    fn pick(&self, configured: Option<&PathBuf>, fallback: Option<&PathBuf>) -> ReplicaNode {
        configured
            .or(fallback)
            .map(ReplicaNode::new)
            .unwrap_or_else(|| ReplicaNode::new(PathBuf::new()))
    }

    /// Whether the given request kind runs a resync first
    pub fn resync_on(&self, trigger: ResyncTrigger) -> bool {
        self.resync.triggers.contains(&trigger)
    }

    /// Get the resync time budget as Duration
    pub fn resync_timeout(&self) -> Duration {
        Duration::from_secs(self.resync.timeout_secs)
    }

    /// Extra executor environment as (key, value) pairs
    pub fn extra_env(&self) -> Vec<(String, String)> {
        self.services
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
