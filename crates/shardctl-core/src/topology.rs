//! Shard topology configuration.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::ShardInfo;

/// Environment variable naming the topology file.
pub const SHARD_CONFIG_ENV: &str = "SHARD_CONFIG";

/// Ordered list of shards. A shard's position is its shard number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTopology {
    pub shards: Vec<ShardInfo>,
}

impl ShardTopology {
    pub fn new(shards: Vec<ShardInfo>) -> Self {
        Self { shards }
    }

    /// Parse a JSON topology, resolve passwords and validate.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let topology: Self = serde_json::from_str(s)?;
        topology.finish()
    }

    /// Parse a YAML topology, resolve passwords and validate.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let topology: Self = serde_yaml::from_str(s)?;
        topology.finish()
    }

    /// Load a topology file; `.yaml`/`.yml` parse as YAML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        debug!(
            subsystem = "config",
            path = %path.display(),
            format = if is_yaml { "yaml" } else { "json" },
            "Loading shard topology"
        );
        if is_yaml {
            Self::from_yaml_str(&contents)
        } else {
            Self::from_json_str(&contents)
        }
    }

    /// Load the topology named by `SHARD_CONFIG`.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(SHARD_CONFIG_ENV).map_err(|_| {
            Error::Config(format!("{} is not set", SHARD_CONFIG_ENV))
        })?;
        Self::load(path)
    }

    fn finish(mut self) -> Result<Self> {
        for shard in &mut self.shards {
            shard.resolve_password()?;
        }
        self.validate()?;
        Ok(self)
    }

    /// At least one shard, unique shard ids.
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::Config("topology has no shards".to_string()));
        }
        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.id) {
                return Err(Error::Config(format!("duplicate shard id {}", shard.id)));
            }
            if shard.host.is_empty() {
                return Err(Error::Config(format!("shard {} has no host", shard.id)));
            }
        }
        Ok(())
    }

    /// Shard with the given id.
    pub fn find(&self, id: i32) -> Result<&ShardInfo> {
        self.shards
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::ShardNotFound(format!("no shard with id {}", id)))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn into_shards(self) -> Vec<ShardInfo> {
        self.shards
    }
}
