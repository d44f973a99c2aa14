//! StagingFileStore - ordered, durable holding area for received parts
//!
//! Producers `add` parts concurrently; each gets the next sequence id. A
//! single consumer drains them in ascending id order with `await_next` and
//! `delete`.
//!
//! # Storage Layout
//!
//! ```text
//! staging/
//! +-- 00000000000000000000/
//! |   +-- part                 # the moved part file or directory
//! |   +-- descriptor.json      # FileDescriptor
//! +-- 00000000000000000001/
//! +-- 00000000000000000002.tmp/  # add in progress, discarded on open
//! ```
//!
//! An entry directory only appears under its final name once complete, so
//! recovery on open is a directory scan.
//!
//! `add` reserves its id under the bounds lock and writes the entry without
//! it, so a slow move never blocks the consumer. Finished ids are published
//! in id order: `max` only advances over a contiguous run of settled ids. An
//! add that fails leaves its id unused, and the consumer skips it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::descriptor::{self, FileDescriptor};
use crate::error::{PlanBError, Result};

const PART_NAME: &str = "part";
const DESCRIPTOR_NAME: &str = "descriptor.json";
const TMP_SUFFIX: &str = ".tmp";

/// Sentinel reported by `min_store_id`/`max_store_id` for an empty store.
pub const EMPTY: i64 = -1;

// ── SequentialFile ──────────────────────────────────────────────────

/// Handle to one staged entry.
#[derive(Debug, Clone)]
pub struct SequentialFile {
    id: i64,
    dir: PathBuf,
    descriptor: FileDescriptor,
}

impl SequentialFile {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    /// The staged part (file or directory).
    pub fn part_path(&self) -> PathBuf {
        self.dir.join(PART_NAME)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// ── StagingFileStore ────────────────────────────────────────────────

#[derive(Debug)]
struct Bounds {
    min: i64,
    max: i64,
    /// Next id to assign. Never decreases, so an emptied store does not
    /// hand out ids a consumer already passed.
    next: i64,
    /// Lowest id not yet published. Ids in `frontier..next` are reserved.
    frontier: i64,
    /// Reserved ids that finished out of order: id -> staged successfully.
    settled: BTreeMap<i64, bool>,
}

pub struct StagingFileStore {
    root: PathBuf,
    bounds: Mutex<Bounds>,
    added: Condvar,
}

impl StagingFileStore {
    /// Open the store at `root`, recovering bounds from existing entries.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;

        let mut min = EMPTY;
        let mut max = EMPTY;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TMP_SUFFIX) {
                warn!(path = %entry.path().display(), "discarding incomplete staged file");
                std::fs::remove_dir_all(entry.path())?;
                continue;
            }
            let Ok(id) = name.parse::<i64>() else {
                continue;
            };
            if min == EMPTY || id < min {
                min = id;
            }
            if id > max {
                max = id;
            }
        }

        debug!(root = %root.display(), min, max, "opened staging store");
        Ok(Self {
            root: root.to_path_buf(),
            bounds: Mutex::new(Bounds {
                min,
                max,
                next: max + 1,
                frontier: max + 1,
                settled: BTreeMap::new(),
            }),
            added: Condvar::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move `path` into the store under the next sequence id.
    ///
    /// On failure `path` is left where it was.
    pub fn add(&self, descriptor: &FileDescriptor, path: &Path) -> Result<SequentialFile> {
        let id = self.reserve();
        match self.write_entry(id, descriptor, path) {
            Ok(dir) => {
                self.settle(id, true);
                debug!(id, name = %descriptor.base_name(), "staged file");
                Ok(SequentialFile {
                    id,
                    dir,
                    descriptor: descriptor.clone(),
                })
            }
            Err(e) => {
                self.settle(id, false);
                warn!(id, error = %e, "failed to stage file");
                Err(e)
            }
        }
    }

    fn reserve(&self) -> i64 {
        let mut bounds = self.bounds.lock();
        let id = bounds.next;
        bounds.next += 1;
        id
    }

    /// Build `<id>.tmp/` and rename it to its final name.
    fn write_entry(&self, id: i64, descriptor: &FileDescriptor, path: &Path) -> Result<PathBuf> {
        let dir = self.entry_dir(id);
        let tmp = self.root.join(format!("{}{}", entry_name(id), TMP_SUFFIX));
        let part = tmp.join(PART_NAME);

        std::fs::create_dir_all(&tmp)?;
        if let Err(e) = move_path(path, &part) {
            let _ = std::fs::remove_dir_all(&tmp);
            return Err(e);
        }

        let finished = (|| -> Result<()> {
            std::fs::write(tmp.join(DESCRIPTOR_NAME), serde_json::to_vec(descriptor)?)?;
            std::fs::rename(&tmp, &dir)?;
            Ok(())
        })();
        if let Err(e) = finished {
            if let Err(restore) = move_path(&part, path) {
                error!(
                    id,
                    part = %part.display(),
                    error = %restore,
                    "could not move part back after failed add"
                );
                return Err(e);
            }
            let _ = std::fs::remove_dir_all(&tmp);
            return Err(e);
        }
        Ok(dir)
    }

    /// Record the outcome of a reserved id and publish every id now ready.
    fn settle(&self, id: i64, staged: bool) {
        let mut bounds = self.bounds.lock();
        bounds.settled.insert(id, staged);
        loop {
            let frontier = bounds.frontier;
            let Some(staged) = bounds.settled.remove(&frontier) else {
                break;
            };
            if staged {
                bounds.max = frontier;
                if bounds.min == EMPTY {
                    bounds.min = frontier;
                }
            }
            bounds.frontier = frontier + 1;
        }
        self.added.notify_all();
    }

    /// Verify `path` against its descriptor, then `add` it.
    pub fn receive(&self, descriptor: &FileDescriptor, path: &Path) -> Result<SequentialFile> {
        descriptor::verify(descriptor, path)?;
        self.add(descriptor, path)
    }

    /// Block until the entry for `id` exists.
    pub fn await_next(&self, id: i64) -> Result<SequentialFile> {
        let mut bounds = self.bounds.lock();
        loop {
            if let Some(file) = self.lookup(&bounds, id)? {
                return Ok(file);
            }
            self.added.wait(&mut bounds);
        }
    }

    /// Like `await_next`, giving up after `timeout`.
    pub fn await_next_timeout(&self, id: i64, timeout: Duration) -> Result<Option<SequentialFile>> {
        let deadline = Instant::now() + timeout;
        let mut bounds = self.bounds.lock();
        loop {
            if let Some(file) = self.lookup(&bounds, id)? {
                return Ok(Some(file));
            }
            if self.added.wait_until(&mut bounds, deadline).timed_out() {
                return self.lookup(&bounds, id);
            }
        }
    }

    /// Remove a consumed entry, advancing `min` when it was the minimum.
    pub fn delete(&self, file: &SequentialFile) -> Result<()> {
        match std::fs::remove_dir_all(&file.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.forget(file);
        Ok(())
    }

    /// Move an entry that can never be consumed out of the store, into
    /// `failed_root`. Returns where it went.
    pub fn quarantine(&self, file: &SequentialFile, failed_root: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(failed_root)?;
        let dest = failed_root.join(format!("{}_{}", entry_name(file.id), file.descriptor.base_name()));
        if dest.exists() {
            std::fs::remove_dir_all(&file.dir)?;
        } else {
            move_path(&file.dir, &dest)?;
        }
        self.forget(file);
        Ok(dest)
    }

    fn forget(&self, file: &SequentialFile) {
        let mut bounds = self.bounds.lock();
        if file.id == bounds.min {
            let mut next = bounds.min + 1;
            while next <= bounds.max && !self.entry_dir(next).exists() {
                next += 1;
            }
            if next > bounds.max {
                bounds.min = EMPTY;
                bounds.max = EMPTY;
            } else {
                bounds.min = next;
            }
        }
        debug!(id = file.id, min = bounds.min, max = bounds.max, "removed staged file");
    }

    pub fn min_store_id(&self) -> i64 {
        self.bounds.lock().min
    }

    pub fn max_store_id(&self) -> i64 {
        self.bounds.lock().max
    }

    /// Id the next `add` will receive.
    pub fn next_store_id(&self) -> i64 {
        self.bounds.lock().next
    }

    /// First id a consumer should wait for.
    pub fn first_pending_id(&self) -> i64 {
        let bounds = self.bounds.lock();
        if bounds.min == EMPTY {
            bounds.frontier
        } else {
            bounds.min
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.lock().min == EMPTY
    }

    fn entry_dir(&self, id: i64) -> PathBuf {
        self.root.join(entry_name(id))
    }

    fn lookup(&self, bounds: &Bounds, id: i64) -> Result<Option<SequentialFile>> {
        if id >= bounds.frontier {
            return Ok(None);
        }
        let dir = self.entry_dir(id);
        if bounds.min == EMPTY || id < bounds.min || id > bounds.max || !dir.exists() {
            return Err(PlanBError::StagedFileNotFound(id));
        }
        let descriptor: FileDescriptor =
            serde_json::from_slice(&std::fs::read(dir.join(DESCRIPTOR_NAME))?)?;
        Ok(Some(SequentialFile { id, dir, descriptor }))
    }
}

fn entry_name(id: i64) -> String {
    format!("{:020}", id)
}

/// Rename, falling back to copy + remove across filesystems.
fn move_path(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_recursive(from, to)?;
    if from.is_dir() {
        std::fs::remove_dir_all(from)?;
    } else {
        std::fs::remove_file(from)?;
    }
    Ok(())
}

pub(crate) fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}
