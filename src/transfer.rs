//! File transfer between nodes.
//!
//! Reader nodes fetch snapshots from storage nodes, and producers push parts
//! to storage nodes. The network client is a collaborator behind
//! [`FileTransferClient`]; [`LocalFileTransferClient`] implements it for
//! nodes living in the same process (single-host deployments and tests).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::descriptor::FileDescriptor;
use crate::error::{PlanBError, Result};
use crate::shard::ShardManager;
use crate::staging::StagingFileStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub map_name: String,
    pub effective_time_ms: i64,
    /// Snapshot time the caller already holds, if any.
    pub current_snapshot_time_ms: Option<i64>,
}

impl SnapshotRequest {
    pub fn new(map_name: &str, effective_time_ms: i64) -> Self {
        Self {
            map_name: map_name.to_string(),
            effective_time_ms,
            current_snapshot_time_ms: None,
        }
    }
}

pub trait FileTransferClient: Send + Sync {
    /// Fetch a snapshot of `request.map_name` into `dest_dir`.
    ///
    /// Returns the snapshot time, or `SnapshotNotModified` when nothing
    /// newer than `request.current_snapshot_time_ms` exists.
    fn fetch_snapshot(&self, request: &SnapshotRequest, dest_dir: &Path) -> Result<SystemTime>;

    /// Hand a part to `node` for staging.
    fn store_part_remotely(&self, node: &str, descriptor: &FileDescriptor, path: &Path) -> Result<()>;
}

// ── Time helpers ────────────────────────────────────────────────────

pub fn now_ms() -> i64 {
    to_millis(SystemTime::now())
}

pub fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

pub fn from_millis(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

// ── In-process client ───────────────────────────────────────────────

/// A storage node reachable in-process.
#[derive(Clone)]
pub struct LocalNode {
    pub name: String,
    pub manager: Arc<ShardManager>,
    pub staging: Arc<StagingFileStore>,
}

/// Serves snapshots and accepts parts from storage nodes in this process.
///
/// Snapshot fetches try nodes in registration order; the first success wins.
pub struct LocalFileTransferClient {
    nodes: Vec<LocalNode>,
}

impl LocalFileTransferClient {
    pub fn new(nodes: Vec<LocalNode>) -> Self {
        Self { nodes }
    }
}

impl FileTransferClient for LocalFileTransferClient {
    fn fetch_snapshot(&self, request: &SnapshotRequest, dest_dir: &Path) -> Result<SystemTime> {
        let mut last_error = None;
        for node in &self.nodes {
            match node.manager.create_snapshot(request, dest_dir) {
                Ok(time) => {
                    debug!(map = %request.map_name, node = %node.name, "fetched snapshot");
                    return Ok(time);
                }
                Err(e @ PlanBError::SnapshotNotModified(_)) => return Err(e),
                Err(e) => {
                    warn!(map = %request.map_name, node = %node.name, error = %e, "snapshot fetch failed");
                    last_error = Some(e);
                }
            }
        }
        Err(PlanBError::Fetch {
            map: request.map_name.clone(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no storage nodes".to_string()),
        })
    }

    fn store_part_remotely(&self, node: &str, descriptor: &FileDescriptor, path: &Path) -> Result<()> {
        let target = self
            .nodes
            .iter()
            .find(|n| n.name == node)
            .ok_or_else(|| PlanBError::Config(format!("unknown node '{}'", node)))?;
        target.staging.receive(descriptor, path)?;
        Ok(())
    }
}
