//! LocalShard - writable shard on a storage node
//!
//! Data lives in `shards/<map>/`. Parts are merged in by the merge
//! processor; maintenance applies retention and condensing. Every mutation
//! and every close runs under `write_lock`, so a database is never closed
//! with a write half applied and never reopened while an older copy still
//! has unpersisted changes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{ConfigProvider, ShardDoc};
use crate::db::{Db, DbFactory, KeyValue, DATA_FILE};
use crate::env::LazyDb;
use crate::error::{PlanBError, Result};
use crate::paths::StatePaths;
use crate::shard::{cutoff, retry_try_again, Shard};
use crate::transfer::{from_millis, now_ms, to_millis, SnapshotRequest};

pub struct LocalShard {
    doc: ShardDoc,
    config: ConfigProvider,
    dir: PathBuf,
    env: LazyDb,
    write_lock: Mutex<()>,
    /// Epoch ms of the last change; doubles as the snapshot time.
    last_write_ms: AtomicI64,
    deleted: AtomicBool,
}

impl LocalShard {
    pub fn new(
        doc: ShardDoc,
        config: ConfigProvider,
        paths: &StatePaths,
        factory: Arc<dyn DbFactory>,
    ) -> Result<Self> {
        let dir = paths.shard_path(&doc.name);
        std::fs::create_dir_all(&dir)?;

        // A restarted node keeps serving the snapshot time its data was written at.
        let last_write_ms = std::fs::metadata(dir.join(DATA_FILE))
            .and_then(|m| m.modified())
            .map(to_millis)
            .unwrap_or(0);

        Ok(Self {
            env: LazyDb::new(dir.clone(), false, factory),
            doc,
            config,
            dir,
            write_lock: Mutex::new(()),
            last_write_ms: AtomicI64::new(last_write_ms),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_write_ms(&self) -> i64 {
        self.last_write_ms.load(Ordering::Acquire)
    }

    fn check_deleted(&self) -> Result<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(PlanBError::ShardNotFound(self.doc.name.clone()));
        }
        Ok(())
    }

    fn with_db<T>(&self, op: impl Fn(&dyn Db) -> Result<T>) -> Result<T> {
        self.check_deleted()?;
        let max = (self.config)().max_try_again;
        retry_try_again(&self.doc.name, max, || self.env.acquire(&op))
    }

    /// Advance the change time, strictly increasing even within one ms.
    fn touch_write(&self) {
        let now = now_ms();
        let _ = self
            .last_write_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            });
    }

    fn prune(
        &self,
        age_ms: Option<u64>,
        what: &'static str,
        op: fn(&dyn Db, i64) -> Result<u64>,
    ) -> Result<u64> {
        let Some(age_ms) = age_ms else {
            return Ok(0);
        };
        let _write = self.write_lock.lock();
        let cutoff_ms = cutoff(now_ms(), age_ms);
        let removed = self.with_db(|db| {
            let removed = op(db, cutoff_ms)?;
            if removed > 0 {
                db.compact()?;
            }
            Ok(removed)
        })?;
        if removed > 0 {
            self.touch_write();
            info!(map = %self.doc.name, removed, cutoff_ms, "{}", what);
        }
        Ok(removed)
    }
}

impl Shard for LocalShard {
    fn doc(&self) -> &ShardDoc {
        &self.doc
    }

    fn get(&self, key: &[u8], effective_time_ms: i64) -> Result<Option<Vec<u8>>> {
        self.with_db(|db| db.get(key, effective_time_ms))
    }

    fn search(&self, prefix: &[u8], effective_time_ms: i64) -> Result<Vec<KeyValue>> {
        self.with_db(|db| db.search(prefix, effective_time_ms))
    }

    fn count(&self) -> Result<u64> {
        self.with_db(|db| db.count())
    }

    fn get_info(&self) -> Result<String> {
        // Sampled before reading, which reopens the db.
        let open = self.env.is_open();
        let db_info = self.with_db(|db| db.info_string())?;
        Ok(json!({
            "map": self.doc.name,
            "uuid": self.doc.uuid,
            "kind": "local",
            "last_write_ms": self.last_write_ms(),
            "open": open,
            "db": db_info,
        })
        .to_string())
    }

    fn merge(&self, source_dir: &Path) -> Result<()> {
        let _write = self.write_lock.lock();
        let merged = self.with_db(|db| {
            let mut merged = 0;
            db.lock(&mut || {
                merged = db.merge(source_dir)?;
                db.compact()
            })?;
            Ok(merged)
        })?;
        self.touch_write();
        info!(map = %self.doc.name, merged, source = %source_dir.display(), "merged part");
        Ok(())
    }

    fn delete_old_data(&self, doc: &ShardDoc) -> Result<u64> {
        self.prune(doc.retention_ms, "deleted old data", |db, c| db.delete_old_data(c))
    }

    fn condense(&self, doc: &ShardDoc) -> Result<u64> {
        self.prune(doc.condense_ms, "condensed", |db, c| db.condense(c))
    }

    fn compact(&self) -> Result<()> {
        let _write = self.write_lock.lock();
        self.with_db(|db| db.compact())
    }

    fn check_snapshot_status(&self, request: &SnapshotRequest) -> Result<i64> {
        self.check_deleted()?;
        let last_write = self.last_write_ms();
        match request.current_snapshot_time_ms {
            Some(current) if current >= last_write => {
                Err(PlanBError::SnapshotNotModified(self.doc.name.clone()))
            }
            _ => Ok(last_write),
        }
    }

    fn create_snapshot(&self, request: &SnapshotRequest, dest_dir: &Path) -> Result<SystemTime> {
        // Read the time first: a merge landing mid-copy makes the snapshot
        // newer than its label, never older.
        let snapshot_time = self.check_snapshot_status(request)?;
        self.with_db(|db| db.write_snapshot(dest_dir))?;
        debug!(map = %self.doc.name, snapshot_time, dest = %dest_dir.display(), "created snapshot");
        Ok(from_millis(snapshot_time))
    }

    fn cleanup(&self) {
        let min_open = (self.config)().min_time_to_keep_env_open();
        let _write = self.write_lock.lock();
        if self.env.close_if_idle(min_open) {
            debug!(map = %self.doc.name, "closed idle shard db");
        }
    }

    fn release(&self) {
        let _write = self.write_lock.lock();
        self.env.close_if_idle(Duration::ZERO);
    }

    fn delete(&self) -> bool {
        self.deleted.store(true, Ordering::Release);
        let _write = self.write_lock.lock();
        self.env.close();
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!(map = %self.doc.name, "deleted shard");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(map = %self.doc.name, error = %e, "failed to delete shard");
                false
            }
        }
    }
}
