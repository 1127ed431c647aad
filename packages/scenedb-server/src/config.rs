//! Cluster configuration.
//!
//! Written once at cluster creation time to `cluster_config.json` and read
//! back on every start, so a restarted server agrees with its peers on the
//! shard count and node-id space.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SceneError};

/// Persistent cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Number of shards (replication groups).
    pub shards: u16,
    /// Replicas hosting every shard.
    pub replicas: usize,
    /// Parallel-commit timeout window, in HLC ticks.
    pub max_latency: u64,
    /// Highest valid node id; ids run `1..=max_node_id`.
    pub max_node_id: u32,
}

/// Transaction participant sets travel as a u32 bitset on the wire, which
/// caps the shard count.
pub const MAX_SHARDS: u16 = 32;

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: 2,
            replicas: 3,
            max_latency: 16,
            max_node_id: 1000,
        }
    }
}

impl ClusterConfig {
    const FILE_NAME: &'static str = "cluster_config.json";

    /// Validate field ranges. Called by constructors and on load.
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(SceneError::InvalidConfig("shards must be > 0".into()));
        }
        if self.shards > MAX_SHARDS {
            return Err(SceneError::InvalidConfig(format!(
                "shards must be <= {} (wire bitset width)",
                MAX_SHARDS
            )));
        }
        if self.replicas == 0 {
            return Err(SceneError::InvalidConfig("replicas must be > 0".into()));
        }
        if self.max_node_id < 3 {
            return Err(SceneError::InvalidConfig(
                "node id space must hold at least 3 nodes".into(),
            ));
        }
        Ok(())
    }

    /// Read config from a cluster directory. Returns None if absent.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write config to a cluster directory.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let path = dir.join(Self::FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}
