//! SnapshotShard - read-only shard served from a fetched snapshot
//!
//! A reader node does not store map data itself. It fetches a point-in-time
//! copy of the storage node's database and serves reads from it until the
//! copy is older than `min_time_to_keep_snapshots`, then fetches a new one in
//! the background.
//!
//! # Concurrency
//!
//! ```text
//! readers (N)                          rotation thread (<= 1 per shard)
//!   |                                    |
//!   +-- current.load_full()              +-- fetch into snapshots/<map>/<t>_<n>
//!   +-- instance.guard.acquire(read)     +-- open db, wrap in new guard
//!   |     TryAgain? reload and retry     +-- current.swap(new)
//!   |                                    +-- old.guard.destroy()
//!   +-- stale? CAS rotating false->true        (closes + removes the old copy
//!         winner spawns rotation               once its readers finish)
//! ```
//!
//! Reads never wait for a fetch once a first snapshot exists. A failed fetch
//! keeps the previous snapshot and pushes its expiry out by
//! `snapshot_retry_fetch_interval`, so an unreachable storage node is not
//! hammered by every read.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{ConfigProvider, PlanBConfig, ShardDoc};
use crate::db::{Db, DbFactory, KeyValue};
use crate::env::LazyDb;
use crate::error::{PlanBError, Result};
use crate::guard::Guard;
use crate::paths::StatePaths;
use crate::shard::{retry_try_again, Shard};
use crate::transfer::{from_millis, now_ms, to_millis, FileTransferClient, SnapshotRequest};

// ── SnapshotInstance ────────────────────────────────────────────────

/// One fetched snapshot and the guard that retires it.
struct SnapshotInstance {
    dir: PathBuf,
    snapshot_time_ms: i64,
    /// Shard clock ms after which a rotation is due.
    expiry_ms: AtomicU64,
    env: Arc<LazyDb>,
    guard: Guard,
}

impl SnapshotInstance {
    /// `shard_deleted` is the owning shard's flag; once set, the last
    /// retired instance also removes the emptied `snapshots/<map>/`.
    fn new(
        dir: PathBuf,
        snapshot_time_ms: i64,
        expiry_ms: u64,
        factory: Arc<dyn DbFactory>,
        shard_deleted: Arc<AtomicBool>,
    ) -> Self {
        let env = Arc::new(LazyDb::new(dir.clone(), true, factory));
        let closing = Arc::clone(&env);
        let removing = dir.clone();
        let guard = Guard::new(move || {
            closing.close();
            match std::fs::remove_dir_all(&removing) {
                Ok(()) => debug!(path = %removing.display(), "removed retired snapshot"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %removing.display(), error = %e, "failed to remove retired snapshot"),
            }
            if shard_deleted.load(Ordering::Acquire) {
                if let Some(root) = removing.parent() {
                    let _ = std::fs::remove_dir(root);
                }
            }
        });
        Self {
            dir,
            snapshot_time_ms,
            expiry_ms: AtomicU64::new(expiry_ms),
            env,
            guard,
        }
    }

    fn read<T>(&self, op: impl FnOnce(&dyn Db) -> Result<T>) -> Result<T> {
        self.guard.acquire(|| self.env.acquire(op))?
    }

    fn destroy(&self) {
        self.guard.destroy();
    }
}

/// Clears the rotation flag when the rotation thread finishes, even by panic.
struct RotationFlag<'a>(&'a AtomicBool);

impl Drop for RotationFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct InitialFailure {
    at_ms: u64,
    reason: String,
}

// ── Shared state ────────────────────────────────────────────────────

struct Inner {
    doc: ShardDoc,
    config: ConfigProvider,
    paths: StatePaths,
    client: Arc<dyn FileTransferClient>,
    factory: Arc<dyn DbFactory>,
    clock: Instant,
    current: ArcSwapOption<SnapshotInstance>,
    /// Serializes the first fetch and remembers its last failure.
    initial: Mutex<Option<InitialFailure>>,
    rotating: AtomicBool,
    fetch_seq: AtomicU64,
    deleted: Arc<AtomicBool>,
}

impl Inner {
    fn clock_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn name(&self) -> &str {
        &self.doc.name
    }

    fn current_instance(self: &Arc<Self>) -> Result<Arc<SnapshotInstance>> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(PlanBError::ShardNotFound(self.doc.name.clone()));
        }
        if let Some(instance) = self.current.load_full() {
            self.check_rotation(&instance);
            return Ok(instance);
        }
        self.initial_fetch()
    }

    fn initial_fetch(&self) -> Result<Arc<SnapshotInstance>> {
        let mut failure = self.initial.lock();
        if let Some(instance) = self.current.load_full() {
            return Ok(instance);
        }

        let config = (self.config)();
        if let Some(last) = failure.as_ref() {
            let retry_ms = config.snapshot_retry_fetch_interval_ms;
            if self.clock_ms() < last.at_ms.saturating_add(retry_ms) {
                return Err(PlanBError::SnapshotUnavailable {
                    map: self.doc.name.clone(),
                    reason: last.reason.clone(),
                });
            }
        }

        let request = SnapshotRequest::new(self.name(), now_ms());
        match self.fetch_instance(&request, &config) {
            Ok(instance) => {
                *failure = None;
                let instance = Arc::new(instance);
                if self.deleted.load(Ordering::Acquire) {
                    instance.destroy();
                    self.remove_root_if_empty();
                    return Err(PlanBError::ShardNotFound(self.doc.name.clone()));
                }
                self.current.store(Some(Arc::clone(&instance)));
                info!(map = %self.name(), snapshot_time_ms = instance.snapshot_time_ms, "loaded snapshot");
                Ok(instance)
            }
            Err(e) => {
                warn!(map = %self.name(), error = %e, "initial snapshot fetch failed");
                let reason = e.to_string();
                *failure = Some(InitialFailure {
                    at_ms: self.clock_ms(),
                    reason: reason.clone(),
                });
                Err(PlanBError::SnapshotUnavailable {
                    map: self.doc.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Start a background rotation if `instance` is stale and none is running.
    fn check_rotation(self: &Arc<Self>, instance: &Arc<SnapshotInstance>) {
        if self.clock_ms() < instance.expiry_ms.load(Ordering::Acquire) {
            return;
        }
        if self
            .rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // A rotation may have finished between loading `instance` and
        // winning the flag: it either swapped in a new instance or pushed
        // this one's expiry out.
        let still_current = self
            .current
            .load_full()
            .map_or(false, |current| Arc::ptr_eq(&current, instance));
        if !still_current || self.clock_ms() < instance.expiry_ms.load(Ordering::Acquire) {
            self.rotating.store(false, Ordering::Release);
            return;
        }

        let inner = Arc::clone(self);
        let old = Arc::clone(instance);
        let spawned = thread::Builder::new()
            .name(format!("planb-rotate-{}", self.name()))
            .spawn(move || {
                let _flag = RotationFlag(&inner.rotating);
                inner.rotate(&old);
            });
        if let Err(e) = spawned {
            warn!(map = %self.name(), error = %e, "failed to start snapshot rotation");
            self.rotating.store(false, Ordering::Release);
        }
    }

    fn rotate(&self, old: &SnapshotInstance) {
        let config = (self.config)();
        let request = SnapshotRequest {
            map_name: self.doc.name.clone(),
            effective_time_ms: now_ms(),
            current_snapshot_time_ms: Some(old.snapshot_time_ms),
        };

        match self.fetch_instance(&request, &config) {
            Ok(instance) => {
                let snapshot_time_ms = instance.snapshot_time_ms;
                let previous = self.current.swap(Some(Arc::new(instance)));
                if let Some(previous) = previous {
                    previous.destroy();
                }
                if self.deleted.load(Ordering::Acquire) {
                    if let Some(orphan) = self.current.swap(None) {
                        orphan.destroy();
                    }
                } else {
                    info!(map = %self.name(), snapshot_time_ms, "rotated snapshot");
                }
            }
            Err(PlanBError::SnapshotNotModified(_)) => {
                let keep = config.min_time_to_keep_snapshots_ms;
                old.expiry_ms
                    .store(self.clock_ms().saturating_add(keep), Ordering::Release);
                debug!(map = %self.name(), "snapshot not modified, keeping current");
            }
            Err(e) => {
                let retry = config.snapshot_retry_fetch_interval_ms;
                old.expiry_ms
                    .store(self.clock_ms().saturating_add(retry), Ordering::Release);
                warn!(
                    map = %self.name(),
                    error = %e,
                    retry_in_ms = retry,
                    "snapshot rotation failed, serving previous snapshot"
                );
            }
        }

        if self.deleted.load(Ordering::Acquire) {
            self.remove_root_if_empty();
        }
    }

    /// Drop `snapshots/<map>/` after a delete raced a fetch that recreated
    /// it. Non-recursive: a directory still holding snapshots is kept.
    fn remove_root_if_empty(&self) {
        let _ = std::fs::remove_dir(self.paths.snapshot_path(self.name()));
    }

    /// Fetch a snapshot into a fresh directory and open it.
    fn fetch_instance(&self, request: &SnapshotRequest, config: &PlanBConfig) -> Result<SnapshotInstance> {
        let seq = self.fetch_seq.fetch_add(1, Ordering::Relaxed);
        let dir = self
            .paths
            .snapshot_path(self.name())
            .join(format!("{}_{}", now_ms(), seq));
        std::fs::create_dir_all(&dir)?;

        let fetched = self.client.fetch_snapshot(request, &dir).and_then(|time| {
            let expiry = self
                .clock_ms()
                .saturating_add(config.min_time_to_keep_snapshots_ms);
            let instance = SnapshotInstance::new(
                dir.clone(),
                to_millis(time),
                expiry,
                Arc::clone(&self.factory),
                Arc::clone(&self.deleted),
            );
            instance.env.open()?;
            Ok(instance)
        });
        if fetched.is_err() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        fetched
    }
}

// ── SnapshotShard ───────────────────────────────────────────────────

pub struct SnapshotShard {
    inner: Arc<Inner>,
}

impl SnapshotShard {
    /// Create the shard. Nothing is fetched until the first read.
    ///
    /// Snapshot copies left behind by a previous process are removed.
    pub fn new(
        doc: ShardDoc,
        config: ConfigProvider,
        paths: StatePaths,
        client: Arc<dyn FileTransferClient>,
        factory: Arc<dyn DbFactory>,
    ) -> Self {
        let stale = paths.snapshot_path(&doc.name);
        match std::fs::remove_dir_all(&stale) {
            Ok(()) => debug!(path = %stale.display(), "removed stale snapshots"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %stale.display(), error = %e, "failed to remove stale snapshots"),
        }

        Self {
            inner: Arc::new(Inner {
                doc,
                config,
                paths,
                client,
                factory,
                clock: Instant::now(),
                current: ArcSwapOption::empty(),
                initial: Mutex::new(None),
                rotating: AtomicBool::new(false),
                fetch_seq: AtomicU64::new(0),
                deleted: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Run `op` against the current snapshot, retrying rotation races.
    pub fn read<T>(&self, op: impl Fn(&dyn Db) -> Result<T>) -> Result<T> {
        let max = (self.inner.config)().max_try_again;
        retry_try_again(self.inner.name(), max, || {
            let instance = self.inner.current_instance()?;
            instance.read(&op)
        })
    }

    pub fn is_rotating(&self) -> bool {
        self.inner.rotating.load(Ordering::Acquire)
    }

    /// Time of the snapshot currently served, if one is loaded.
    pub fn snapshot_time(&self) -> Option<SystemTime> {
        self.inner
            .current
            .load_full()
            .map(|i| from_millis(i.snapshot_time_ms))
    }

    /// Directory of the snapshot currently served.
    pub fn snapshot_dir(&self) -> Option<PathBuf> {
        self.inner.current.load_full().map(|i| i.dir.clone())
    }

    /// Wait for an in-flight rotation to finish. Returns false on timeout.
    pub fn wait_for_rotation(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_rotating() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

impl Shard for SnapshotShard {
    fn doc(&self) -> &ShardDoc {
        &self.inner.doc
    }

    fn get(&self, key: &[u8], effective_time_ms: i64) -> Result<Option<Vec<u8>>> {
        self.read(|db| db.get(key, effective_time_ms))
    }

    fn search(&self, prefix: &[u8], effective_time_ms: i64) -> Result<Vec<KeyValue>> {
        self.read(|db| db.search(prefix, effective_time_ms))
    }

    fn count(&self) -> Result<u64> {
        self.read(|db| db.count())
    }

    fn get_info(&self) -> Result<String> {
        let max = (self.inner.config)().max_try_again;
        retry_try_again(self.inner.name(), max, || {
            let instance = self.inner.current_instance()?;
            let db_info = instance.read(|db| db.info_string())?;
            let expires_in_ms = instance
                .expiry_ms
                .load(Ordering::Acquire)
                .saturating_sub(self.inner.clock_ms());
            Ok(json!({
                "map": self.inner.doc.name,
                "uuid": self.inner.doc.uuid,
                "kind": "snapshot",
                "snapshot_time_ms": instance.snapshot_time_ms,
                "expires_in_ms": expires_in_ms,
                "rotating": self.is_rotating(),
                "db": db_info,
            })
            .to_string())
        })
    }

    fn merge(&self, _source_dir: &Path) -> Result<()> {
        Err(PlanBError::Unsupported("merge"))
    }

    fn delete_old_data(&self, _doc: &ShardDoc) -> Result<u64> {
        Ok(0)
    }

    fn condense(&self, _doc: &ShardDoc) -> Result<u64> {
        Ok(0)
    }

    fn compact(&self) -> Result<()> {
        Err(PlanBError::Unsupported("compact"))
    }

    fn check_snapshot_status(&self, _request: &SnapshotRequest) -> Result<i64> {
        Err(PlanBError::Unsupported("check_snapshot_status"))
    }

    fn create_snapshot(&self, _request: &SnapshotRequest, _dest_dir: &Path) -> Result<SystemTime> {
        Err(PlanBError::Unsupported("create_snapshot"))
    }

    fn cleanup(&self) {
        let min_open = (self.inner.config)().min_time_to_keep_env_open();
        if let Some(instance) = self.inner.current.load_full() {
            if instance.env.close_if_idle(min_open) {
                debug!(map = %self.inner.name(), "closed idle snapshot db");
            }
        }
    }

    fn release(&self) {
        if let Some(instance) = self.inner.current.load_full() {
            instance.env.close_if_idle(Duration::ZERO);
        }
    }

    fn delete(&self) -> bool {
        self.inner.deleted.store(true, Ordering::Release);
        if let Some(instance) = self.inner.current.swap(None) {
            instance.destroy();
        }

        let dir = self.inner.paths.snapshot_path(self.inner.name());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(map = %self.inner.name(), error = %e, "failed to delete snapshot shard");
                false
            }
        }
    }
}
