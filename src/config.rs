//! Node configuration and map documents.
//!
//! `PlanBConfig` is read from a JSON file. Components never keep a copy of
//! it: they are handed a [`ConfigProvider`] and call it whenever they need a
//! setting, so a config replaced through [`SharedConfig::update`] takes
//! effect on the next check.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::{PlanBError, Result};

/// Accessor for the current configuration.
pub type ConfigProvider = Arc<dyn Fn() -> Arc<PlanBConfig> + Send + Sync>;

// ── Map documents ──────────────────────────────────────────────────

/// Describes one logical map (and therefore one shard).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardDoc {
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    /// Versions older than this age are removed by `delete_old_data`.
    #[serde(default)]
    pub retention_ms: Option<u64>,
    /// Versions older than this age are condensed.
    #[serde(default)]
    pub condense_ms: Option<u64>,
}

impl ShardDoc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uuid: derive_uuid(name),
            retention_ms: None,
            condense_ms: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_ms = Some(retention.as_millis() as u64);
        self
    }

    pub fn with_condense(mut self, condense: Duration) -> Self {
        self.condense_ms = Some(condense.as_millis() as u64);
        self
    }

    /// Validate a map name.
    ///
    /// Allowed characters: [a-zA-Z0-9_-]
    /// Length: 1-128 characters
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 128 {
            return Err(PlanBError::InvalidName(
                "Name must be 1-128 characters".to_string(),
            ));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

        if !valid {
            return Err(PlanBError::InvalidName(format!(
                "'{}' can only contain a-z, A-Z, 0-9, _, -",
                name
            )));
        }

        Ok(())
    }
}

/// Stable uuid-shaped identifier derived from the map name.
fn derive_uuid(name: &str) -> String {
    let hex = blake3::hash(name.as_bytes()).to_hex();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

// ── Node configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanBConfig {
    /// Root directory for receive, staging, shard and snapshot data.
    pub path: PathBuf,
    /// Name of this node.
    pub this_node: String,
    /// Nodes that store shards. Empty means every node stores everything.
    pub nodes: Vec<String>,
    pub min_time_to_keep_snapshots_ms: u64,
    pub min_time_to_keep_env_open_ms: u64,
    pub snapshot_retry_fetch_interval_ms: u64,
    /// Cap on internal retries when a read races a snapshot rotation.
    pub max_try_again: usize,
    pub merge_poll_interval_ms: u64,
    pub maintenance_interval_ms: u64,
    pub maps: Vec<ShardDoc>,
}

impl Default for PlanBConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("planb"),
            this_node: "node1".to_string(),
            nodes: Vec::new(),
            min_time_to_keep_snapshots_ms: 10 * 60 * 1000,
            min_time_to_keep_env_open_ms: 60 * 1000,
            snapshot_retry_fetch_interval_ms: 30 * 1000,
            max_try_again: 10,
            merge_poll_interval_ms: 1000,
            maintenance_interval_ms: 10 * 1000,
            maps: Vec::new(),
        }
    }
}

impl PlanBConfig {
    /// Read config from a JSON file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_try_again == 0 {
            return Err(PlanBError::Config("max_try_again must be > 0".to_string()));
        }
        for doc in &self.maps {
            ShardDoc::validate_name(&doc.name)?;
        }
        Ok(())
    }

    /// True when this node keeps writable shards rather than snapshots.
    pub fn is_storage_node(&self) -> bool {
        self.nodes.is_empty() || self.nodes.iter().any(|n| n == &self.this_node)
    }

    /// Document for `name`; unknown maps get a default document.
    pub fn doc_for(&self, name: &str) -> ShardDoc {
        self.maps
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .unwrap_or_else(|| ShardDoc::new(name))
    }

    pub fn min_time_to_keep_snapshots(&self) -> Duration {
        Duration::from_millis(self.min_time_to_keep_snapshots_ms)
    }

    pub fn min_time_to_keep_env_open(&self) -> Duration {
        Duration::from_millis(self.min_time_to_keep_env_open_ms)
    }

    pub fn snapshot_retry_fetch_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_fetch_interval_ms)
    }

    pub fn merge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.merge_poll_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Provider that always returns this config.
    pub fn fixed(self) -> ConfigProvider {
        let config = Arc::new(self);
        Arc::new(move || Arc::clone(&config))
    }
}

// ── Hot-reloadable config ──────────────────────────────────────────

/// Config cell that can be replaced while components are running.
#[derive(Clone)]
pub struct SharedConfig {
    cell: Arc<ArcSwap<PlanBConfig>>,
}

impl SharedConfig {
    pub fn new(config: PlanBConfig) -> Self {
        Self {
            cell: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn update(&self, config: PlanBConfig) {
        self.cell.store(Arc::new(config));
    }

    pub fn current(&self) -> Arc<PlanBConfig> {
        self.cell.load_full()
    }

    pub fn provider(&self) -> ConfigProvider {
        let cell = Arc::clone(&self.cell);
        Arc::new(move || cell.load_full())
    }
}
