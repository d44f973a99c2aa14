//! Guarded, lazily opened database environments.
//!
//! `GuardedDb` pairs an open [`Db`] with the [`Guard`] that closes it, so a
//! database is only closed once every operation using it has finished.
//! `LazyDb` owns the current `GuardedDb` for one directory: it opens on first
//! use, and `close_if_idle` releases it when unused for a while. The next
//! access simply reopens it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::db::{Db, DbFactory};
use crate::error::{PlanBError, Result};
use crate::guard::Guard;

// ── GuardedDb ───────────────────────────────────────────────────────

pub struct GuardedDb {
    db: Arc<dyn Db>,
    guard: Guard,
}

impl GuardedDb {
    pub fn new(db: Arc<dyn Db>) -> Self {
        let closing = Arc::clone(&db);
        let guard = Guard::new(move || match closing.close() {
            Ok(()) => debug!(path = %closing.path().display(), "closed db"),
            Err(e) => warn!(path = %closing.path().display(), error = %e, "failed to close db"),
        });
        Self { db, guard }
    }

    pub fn acquire<T>(&self, op: impl FnOnce(&dyn Db) -> T) -> Result<T> {
        self.guard.acquire(|| op(self.db.as_ref()))
    }

    pub fn destroy(&self) {
        self.guard.destroy();
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }
}

// ── LazyDb ──────────────────────────────────────────────────────────

pub struct LazyDb {
    dir: PathBuf,
    read_only: bool,
    factory: Arc<dyn DbFactory>,
    current: ArcSwapOption<GuardedDb>,
    /// Serializes open and close; never held while a caller's operation runs.
    open_lock: Mutex<()>,
    epoch: Instant,
    last_access_ms: AtomicU64,
    shut: AtomicBool,
}

impl LazyDb {
    pub fn new(dir: PathBuf, read_only: bool, factory: Arc<dyn DbFactory>) -> Self {
        Self {
            dir,
            read_only,
            factory,
            current: ArcSwapOption::empty(),
            open_lock: Mutex::new(()),
            epoch: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            shut: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run `op` against the database, opening it if needed.
    ///
    /// Returns `TryAgain` if the environment was closed while this call was
    /// obtaining it; the caller retries.
    pub fn acquire<T>(&self, op: impl FnOnce(&dyn Db) -> Result<T>) -> Result<T> {
        self.touch();
        let env = self.get_or_open()?;
        env.acquire(op)?
    }

    /// Open now so open errors surface to the caller.
    pub fn open(&self) -> Result<()> {
        self.get_or_open().map(|_| ())
    }

    pub fn is_open(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_access_ms.load(Ordering::Acquire)))
    }

    /// Close the database if it has not been used for `min_open`.
    /// Returns true if it was closed.
    pub fn close_if_idle(&self, min_open: Duration) -> bool {
        let _open = self.open_lock.lock();
        if self.idle_for() < min_open {
            return false;
        }
        match self.current.swap(None) {
            Some(env) => {
                debug!(path = %self.dir.display(), "closing idle db");
                env.destroy();
                true
            }
            None => false,
        }
    }

    /// Close for good; later calls to `acquire` get `TryAgain`.
    pub fn close(&self) {
        let _open = self.open_lock.lock();
        self.shut.store(true, Ordering::Release);
        if let Some(env) = self.current.swap(None) {
            env.destroy();
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_access_ms.store(now, Ordering::Release);
    }

    fn get_or_open(&self) -> Result<Arc<GuardedDb>> {
        if let Some(env) = self.current.load_full() {
            return Ok(env);
        }

        let _open = self.open_lock.lock();
        if let Some(env) = self.current.load_full() {
            return Ok(env);
        }
        if self.shut.load(Ordering::Acquire) {
            return Err(PlanBError::TryAgain);
        }

        let db = self.factory.open(&self.dir, self.read_only)?;
        debug!(path = %self.dir.display(), read_only = self.read_only, "opened db");
        let env = Arc::new(GuardedDb::new(db));
        self.current.store(Some(Arc::clone(&env)));
        Ok(env)
    }
}

impl Drop for LazyDb {
    fn drop(&mut self) {
        if let Some(env) = self.current.swap(None) {
            env.destroy();
        }
    }
}
