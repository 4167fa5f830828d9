//! Node configuration
//!
//! Plain structs with serde derive, loadable from a TOML file. Every
//! field has a default so partial files and programmatic construction
//! both work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::NamespaceId;

/// P2P settings for the gossip client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PConfig {
    /// Address the gossip client listens on; port 0 picks a free port
    pub listen_address: String,
    /// Seed peers dialed on start
    pub seeds: Vec<String>,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            seeds: Vec::new(),
        }
    }
}

/// Settings of the block manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockManagerConfig {
    /// Interval between produced blocks
    #[serde(with = "duration_millis")]
    pub block_time: Duration,
    /// Cadence of DA submission and retrieval
    #[serde(with = "duration_millis")]
    pub da_block_time: Duration,
    /// Namespace the chain's blocks live under on the DA layer
    pub namespace_id: NamespaceId,
    /// Maximum transactions drained from the mempool per block
    pub block_max_txs: usize,
}

impl Default for BlockManagerConfig {
    fn default() -> Self {
        Self {
            block_time: Duration::from_secs(1),
            da_block_time: Duration::from_millis(500),
            namespace_id: NamespaceId::default(),
            block_max_txs: 1000,
        }
    }
}

/// RPC ingress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub listen_address: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:26657".to_string(),
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory; empty together with `db_path` means in-memory
    pub root_dir: String,
    /// Database directory under `root_dir`
    pub db_path: String,
    /// Name of the DA adapter to instantiate
    pub da_layer: String,
    /// Opaque configuration blob handed to the DA adapter
    pub da_config: String,
    /// This node produces blocks
    pub aggregator: bool,
    /// Produce only when the mempool is non-empty
    pub lazy_aggregator: bool,
    /// Run the light profile
    pub light: bool,
    /// Report inclusion heights from the direct-tx endpoint
    pub progressive_sequencer: bool,
    /// Generate and verify fraud proofs
    pub fraud_proofs: bool,
    /// Hex-encoded hash the height-1 header must match
    pub trusted_hash: String,
    pub block_manager: BlockManagerConfig,
    pub p2p: P2PConfig,
    pub rpc: RpcConfig,
}

impl NodeConfig {
    /// Whether block and state storage should live purely in memory.
    pub fn in_memory(&self) -> bool {
        self.root_dir.is_empty() && self.db_path.is_empty()
    }
}

/// Load a node configuration from a TOML file.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
    let config_str = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {:?}", path.as_ref()))?;
    let config: NodeConfig = toml::from_str(&config_str)?;
    Ok(config)
}

/// Database directory derived from the configured paths.
pub fn db_dir(config: &NodeConfig) -> PathBuf {
    Path::new(&config.root_dir).join(&config.db_path)
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
