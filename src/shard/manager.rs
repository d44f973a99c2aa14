//! ShardManager - Thread-safe registry of shards
//!
//! One shard per map, created on first use. Storage nodes get a
//! [`LocalShard`]; every other node gets a [`SnapshotShard`] fed by the
//! node's [`FileTransferClient`].
//!
//! # Usage
//!
//! ```no_run
//! use planb::config::PlanBConfig;
//! use planb::db::FileDbFactory;
//! use planb::paths::StatePaths;
//! use planb::shard::ShardManager;
//! use std::sync::Arc;
//!
//! let config = PlanBConfig::default();
//! let paths = StatePaths::new(&config.path);
//! let manager = ShardManager::new(config.fixed(), paths, None, Arc::new(FileDbFactory));
//!
//! let value = manager.get("hosts", b"web-1", 1_700_000_000_000).unwrap();
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{ConfigProvider, ShardDoc};
use crate::db::{DbFactory, KeyValue};
use crate::error::{PlanBError, Result};
use crate::paths::StatePaths;
use crate::shard::{LocalShard, Shard, SnapshotShard};
use crate::transfer::{FileTransferClient, SnapshotRequest};

pub struct ShardManager {
    config: ConfigProvider,
    paths: StatePaths,
    /// Required on reader nodes only.
    client: Option<Arc<dyn FileTransferClient>>,
    factory: Arc<dyn DbFactory>,
    shards: RwLock<HashMap<String, Arc<dyn Shard>>>,
}

impl ShardManager {
    pub fn new(
        config: ConfigProvider,
        paths: StatePaths,
        client: Option<Arc<dyn FileTransferClient>>,
        factory: Arc<dyn DbFactory>,
    ) -> Self {
        Self {
            config,
            paths,
            client,
            factory,
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Get the shard for `name`, creating it on first use.
    pub fn get_shard(&self, name: &str) -> Result<Arc<dyn Shard>> {
        ShardDoc::validate_name(name)?;

        if let Some(shard) = self.shards.read().get(name) {
            return Ok(Arc::clone(shard));
        }

        let mut shards = self.shards.write();
        if let Some(shard) = shards.get(name) {
            return Ok(Arc::clone(shard));
        }
        let shard = self.create_shard(name)?;
        shards.insert(name.to_string(), Arc::clone(&shard));
        Ok(shard)
    }

    fn create_shard(&self, name: &str) -> Result<Arc<dyn Shard>> {
        let config = (self.config)();
        let doc = config.doc_for(name);

        if config.is_storage_node() {
            info!(map = name, "opening local shard");
            let shard = LocalShard::new(
                doc,
                Arc::clone(&self.config),
                &self.paths,
                Arc::clone(&self.factory),
            )?;
            return Ok(Arc::new(shard));
        }

        let client = self.client.as_ref().ok_or_else(|| {
            PlanBError::Config(format!(
                "node '{}' is not a storage node and has no transfer client",
                config.this_node
            ))
        })?;
        info!(map = name, "opening snapshot shard");
        Ok(Arc::new(SnapshotShard::new(
            doc,
            Arc::clone(&self.config),
            self.paths.clone(),
            Arc::clone(client),
            Arc::clone(&self.factory),
        )))
    }

    /// Register shards already on disk so maintenance reaches them after a
    /// restart. Storage nodes only; returns the number loaded.
    pub fn load_existing(&self) -> Result<usize> {
        if !(self.config)().is_storage_node() {
            return Ok(0);
        }
        let dir = self.paths.shard_dir();
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if ShardDoc::validate_name(&name).is_err() {
                warn!(path = %entry.path().display(), "ignoring unexpected shard directory");
                continue;
            }
            self.get_shard(&name)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Snapshot of the registry, so no lock is held while shards work.
    fn all_shards(&self) -> Vec<Arc<dyn Shard>> {
        self.shards.read().values().cloned().collect()
    }

    pub fn shard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shards.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ── Per-map operations ─────────────────────────────────────────

    pub fn get(&self, map: &str, key: &[u8], effective_time_ms: i64) -> Result<Option<Vec<u8>>> {
        self.get_shard(map)?.get(key, effective_time_ms)
    }

    pub fn search(&self, map: &str, prefix: &[u8], effective_time_ms: i64) -> Result<Vec<KeyValue>> {
        self.get_shard(map)?.search(prefix, effective_time_ms)
    }

    pub fn merge(&self, map: &str, source_dir: &Path) -> Result<()> {
        self.get_shard(map)?.merge(source_dir)
    }

    pub fn get_info(&self, map: &str) -> Result<String> {
        self.get_shard(map)?.get_info()
    }

    pub fn check_snapshot_status(&self, request: &SnapshotRequest) -> Result<i64> {
        self.get_shard(&request.map_name)?.check_snapshot_status(request)
    }

    pub fn create_snapshot(&self, request: &SnapshotRequest, dest_dir: &Path) -> Result<SystemTime> {
        self.get_shard(&request.map_name)?.create_snapshot(request, dest_dir)
    }

    /// Remove a map's shard and its files. Returns false if the files
    /// could not all be removed.
    pub fn delete(&self, map: &str) -> Result<bool> {
        ShardDoc::validate_name(map)?;
        let removed = self.shards.write().remove(map);
        if let Some(shard) = removed {
            return Ok(shard.delete());
        }

        let mut ok = true;
        for dir in [self.paths.shard_path(map), self.paths.snapshot_path(map)] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(map, path = %dir.display(), error = %e, "failed to delete map files");
                    ok = false;
                }
            }
        }
        Ok(ok)
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Close databases idle for longer than `min_time_to_keep_env_open`.
    pub fn cleanup(&self) {
        for shard in self.all_shards() {
            shard.cleanup();
        }
    }

    /// Condense every shard with its configured age. Returns versions removed.
    pub fn condense_all(&self) -> u64 {
        let config = (self.config)();
        let mut total = 0;
        for shard in self.all_shards() {
            let name = &shard.doc().name;
            match shard.condense(&config.doc_for(name)) {
                Ok(removed) => total += removed,
                Err(e) => warn!(map = %name, error = %e, "condense failed"),
            }
        }
        total
    }

    /// Apply every shard's retention. Returns versions removed.
    pub fn delete_old_data_all(&self) -> u64 {
        let config = (self.config)();
        let mut total = 0;
        for shard in self.all_shards() {
            let name = &shard.doc().name;
            match shard.delete_old_data(&config.doc_for(name)) {
                Ok(removed) => total += removed,
                Err(e) => warn!(map = %name, error = %e, "delete old data failed"),
            }
        }
        total
    }

    /// Close every database; shards reopen on next use.
    pub fn shutdown(&self) {
        let shards = self.all_shards();
        info!(count = shards.len(), "releasing shards");
        for shard in shards {
            shard.release();
        }
    }
}
