//! Configuration for shardplace components
//!
//! Values come from an optional `shardplace.toml`, then `SHARDPLACE_*`
//! environment variables (nested keys separated by `__`), then CLI flags.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node ID (unique identifier)
    pub node_id: String,

    /// Coordinator server config
    pub coordinator: CoordinatorConfig,

    /// Replica provisioning tunables
    pub provisioning: ProvisioningConfig,

    /// Logging level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "coord-1".to_string(),
            coordinator: CoordinatorConfig::default(),
            provisioning: ProvisioningConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `shardplace.toml` (if present) with environment overrides
    pub fn load() -> Result<Self> {
        Self::load_from("shardplace")
    }

    /// Load from a named config file (extension resolved by the `config` crate)
    pub fn load_from(name: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(config::Environment::with_prefix("SHARDPLACE").separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        self.provisioning.validate()
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bind address for the HTTP admin API
    pub bind_addr: SocketAddr,

    /// RocksDB path for the durable mutation log
    pub db_path: PathBuf,

    /// Whether this process starts as the state-applying leader
    pub leader: bool,

    /// Timeout for a single request to a node endpoint
    pub node_request_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            db_path: PathBuf::from("./coord-data"),
            leader: true,
            node_request_timeout_ms: 30_000,
        }
    }
}

/// Tunables for the add-replica workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Default wait-for-final-state timeout
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Bound on waiting for an enqueued replica to show up in local state
    #[serde(default = "default_state_visibility_timeout_ms")]
    pub state_visibility_timeout_ms: u64,

    /// Bound on waiting for the node to report its core-node-name
    #[serde(default = "default_core_node_name_timeout_secs")]
    pub core_node_name_timeout_secs: u64,

    /// Poll interval for async node request status
    #[serde(default = "default_async_poll_interval_ms")]
    pub async_poll_interval_ms: u64,

    /// Bound on polling a node for the outcome of an async create
    #[serde(default = "default_max_async_wait_ms")]
    pub max_async_wait_ms: u64,

    /// Finished async statuses kept before the oldest are evicted
    #[serde(default = "default_async_status_retention")]
    pub async_status_retention: usize,

    /// Max concurrently running background completion actions
    #[serde(default = "default_completion_pool_size")]
    pub completion_pool_size: usize,

    /// Legacy mode: nodes register replicas themselves, no queue mutation
    #[serde(default)]
    pub legacy_cloud: bool,

    /// Cluster-wide policy name; enables policy placement for every collection
    #[serde(default)]
    pub cluster_policy: Option<String>,

    /// Named placement policies
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyRules>,
}

fn default_timeout_secs() -> u64 {
    600
}
fn default_state_visibility_timeout_ms() -> u64 {
    30_000
}
fn default_core_node_name_timeout_secs() -> u64 {
    320
}
fn default_async_poll_interval_ms() -> u64 {
    500
}
fn default_max_async_wait_ms() -> u64 {
    600_000
}
fn default_async_status_retention() -> usize {
    1_000
}
fn default_completion_pool_size() -> usize {
    16
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            state_visibility_timeout_ms: default_state_visibility_timeout_ms(),
            core_node_name_timeout_secs: default_core_node_name_timeout_secs(),
            async_poll_interval_ms: default_async_poll_interval_ms(),
            max_async_wait_ms: default_max_async_wait_ms(),
            async_status_retention: default_async_status_retention(),
            completion_pool_size: default_completion_pool_size(),
            legacy_cloud: false,
            cluster_policy: None,
            policies: BTreeMap::new(),
        }
    }
}

impl ProvisioningConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn state_visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.state_visibility_timeout_ms)
    }

    pub fn core_node_name_timeout(&self) -> Duration {
        Duration::from_secs(self.core_node_name_timeout_secs)
    }

    pub fn async_poll_interval(&self) -> Duration {
        Duration::from_millis(self.async_poll_interval_ms)
    }

    pub fn max_async_wait(&self) -> Duration {
        Duration::from_millis(self.max_async_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.completion_pool_size == 0 {
            return Err(Error::InvalidConfig(
                "completion_pool_size must be at least 1".into(),
            ));
        }
        if self.async_poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "async_poll_interval_ms must be positive".into(),
            ));
        }
        if self.max_async_wait_ms == 0 {
            return Err(Error::InvalidConfig(
                "max_async_wait_ms must be positive".into(),
            ));
        }
        if let Some(name) = &self.cluster_policy {
            if !self.policies.contains_key(name) {
                return Err(Error::InvalidConfig(format!(
                    "cluster_policy {} is not defined in policies",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Constraints of one named placement policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    /// Max replicas (any collection) a node may host
    pub max_replicas_per_node: Option<usize>,

    /// Max replicas of the same shard on one node
    pub max_shard_replicas_per_node: Option<usize>,

    /// Nodes never chosen by this policy
    pub excluded_nodes: Vec<String>,
}
