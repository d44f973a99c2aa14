//! Shards - one logical partition of a map, backed by one database.
//!
//! - [`LocalShard`]: writable shard on a storage node; merges staged parts.
//! - [`SnapshotShard`]: read-only shard on a reader node; serves a fetched
//!   snapshot and rotates it when it goes stale.
//! - [`ShardManager`]: registry choosing the right kind per node.
//!
//! Both kinds read through a guard, so a read can race a close. The race
//! surfaces as `TryAgain` and is retried here, never by callers.

use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::config::ShardDoc;
use crate::db::KeyValue;
use crate::error::{PlanBError, Result};
use crate::transfer::SnapshotRequest;

pub mod local;
pub mod manager;
pub mod snapshot;

pub use local::LocalShard;
pub use manager::ShardManager;
pub use snapshot::SnapshotShard;

pub trait Shard: Send + Sync {
    fn doc(&self) -> &ShardDoc;

    fn get(&self, key: &[u8], effective_time_ms: i64) -> Result<Option<Vec<u8>>>;

    fn search(&self, prefix: &[u8], effective_time_ms: i64) -> Result<Vec<KeyValue>>;

    fn count(&self) -> Result<u64>;

    /// Human readable JSON description of the shard and its database.
    fn get_info(&self) -> Result<String>;

    /// Merge a part's database directory into this shard.
    fn merge(&self, source_dir: &Path) -> Result<()>;

    /// Apply `doc`'s retention. Returns versions removed.
    fn delete_old_data(&self, doc: &ShardDoc) -> Result<u64>;

    /// Apply `doc`'s condense age. Returns versions removed.
    fn condense(&self, doc: &ShardDoc) -> Result<u64>;

    fn compact(&self) -> Result<()>;

    /// Current snapshot time in ms, or `SnapshotNotModified` when the
    /// requester is already up to date.
    fn check_snapshot_status(&self, request: &SnapshotRequest) -> Result<i64>;

    /// Write a snapshot into `dest_dir`. Returns the snapshot time.
    fn create_snapshot(&self, request: &SnapshotRequest, dest_dir: &Path) -> Result<SystemTime>;

    /// Close the database if it has been idle long enough.
    fn cleanup(&self);

    /// Close the database now; the next access reopens it.
    fn release(&self);

    /// Destroy the shard and remove its files. Returns true on success.
    fn delete(&self) -> bool;
}

/// Run `attempt` until it stops failing with `TryAgain`, at most
/// `max_attempts` times.
pub(crate) fn retry_try_again<T>(
    map: &str,
    max_attempts: usize,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let max_attempts = max_attempts.max(1);
    for n in 1..=max_attempts {
        match attempt() {
            Err(PlanBError::TryAgain) => debug!(map, attempt = n, "raced a close, retrying"),
            other => return other,
        }
    }
    warn!(map, attempts = max_attempts, "giving up after repeated try-again");
    Err(PlanBError::Busy(max_attempts))
}

/// Cutoff in epoch ms for an age in ms, relative to `now_ms`.
pub(crate) fn cutoff(now_ms: i64, age_ms: u64) -> i64 {
    now_ms.saturating_sub(age_ms.min(i64::MAX as u64) as i64)
}
