//! On-disk layout of a Plan B node.
//!
//! ```text
//! <root>/
//! +-- receive/            # parts being received, not yet verified
//! +-- staging/            # verified parts awaiting merge (StagingFileStore)
//! +-- failed/             # staged parts that can never merge
//! +-- shards/<map>/       # writable shard databases (storage nodes)
//! +-- snapshots/<map>/<fetch_ms>_<seq>/  # fetched snapshots (reader nodes)
//! ```

use std::path::{Path, PathBuf};

use crate::error::Result;

const RECEIVE_DIR: &str = "receive";
const STAGING_DIR: &str = "staging";
const FAILED_DIR: &str = "failed";
const SHARD_DIR: &str = "shards";
const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn receive_dir(&self) -> PathBuf {
        self.root.join(RECEIVE_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.root.join(SHARD_DIR)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR)
    }

    pub fn shard_path(&self, map_name: &str) -> PathBuf {
        self.shard_dir().join(map_name)
    }

    pub fn snapshot_path(&self, map_name: &str) -> PathBuf {
        self.snapshot_dir().join(map_name)
    }

    /// Create all working directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.receive_dir(),
            self.staging_dir(),
            self.failed_dir(),
            self.shard_dir(),
            self.snapshot_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
