//! Embedded key-value database interface and a file-backed reference engine.
//!
//! Shards treat the database as a black box behind the [`Db`] trait. The
//! crate ships [`FileDb`], a small temporal map persisted as one `bincode`
//! file, so nodes and tests run without an external engine.
//!
//! # Storage Layout
//!
//! ```text
//! <db dir>/
//! +-- data.bin        # bincode DbFile { entries: key -> [(time_ms, value)] }
//! +-- data.bin.tmp    # transient, renamed over data.bin on persist
//! ```
//!
//! Every key holds a list of versions sorted by time. A read at effective
//! time `t` sees the newest version with `time_ms <= t`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{PlanBError, Result};

pub const DATA_FILE: &str = "data.bin";
const TMP_FILE: &str = "data.bin.tmp";
const FORMAT_VERSION: u32 = 1;

pub type KeyValue = (Vec<u8>, Vec<u8>);

// ── Db trait ────────────────────────────────────────────────────────

pub trait Db: Send + Sync {
    /// Directory the database lives in.
    fn path(&self) -> &Path;

    /// Value of `key` as of `effective_time_ms`.
    fn get(&self, key: &[u8], effective_time_ms: i64) -> Result<Option<Vec<u8>>>;

    /// All keys starting with `prefix` with their value as of `effective_time_ms`.
    fn search(&self, prefix: &[u8], effective_time_ms: i64) -> Result<Vec<KeyValue>>;

    fn insert(&self, key: &[u8], value: &[u8], time_ms: i64) -> Result<()>;

    fn create_writer(&self) -> DbWriter {
        DbWriter::default()
    }

    /// Apply a batch atomically. Returns the number of versions written.
    fn write(&self, writer: DbWriter) -> Result<usize>;

    /// Merge every version held by the database in `source_dir`.
    fn merge(&self, source_dir: &Path) -> Result<u64>;

    /// Remove versions older than `cutoff_ms`. Returns versions removed.
    fn delete_old_data(&self, cutoff_ms: i64) -> Result<u64>;

    /// Collapse runs of equal values older than `cutoff_ms`. Returns versions removed.
    fn condense(&self, cutoff_ms: i64) -> Result<u64>;

    /// Persist pending changes and drop empty keys.
    fn compact(&self) -> Result<()>;

    /// Persist and copy the database files into `dest_dir`.
    fn write_snapshot(&self, dest_dir: &Path) -> Result<()>;

    /// Run `f` exclusively with respect to other `lock` callers.
    fn lock(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Number of keys.
    fn count(&self) -> Result<u64>;

    fn info_string(&self) -> Result<String>;

    /// Close the database. A second call returns `AlreadyClosed`.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens databases for shards.
pub trait DbFactory: Send + Sync {
    fn open(&self, dir: &Path, read_only: bool) -> Result<Arc<dyn Db>>;
}

// ── Writer ──────────────────────────────────────────────────────────

/// Batch of versions applied by [`Db::write`].
#[derive(Debug, Default, Clone)]
pub struct DbWriter {
    puts: Vec<(Vec<u8>, Vec<u8>, i64)>,
}

impl DbWriter {
    pub fn put(&mut self, key: &[u8], value: &[u8], time_ms: i64) {
        self.puts.push((key.to_vec(), value.to_vec(), time_ms));
    }

    pub fn len(&self) -> usize {
        self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }
}

// ── FileDb ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Version {
    time_ms: i64,
    value: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DbFile {
    format_version: u32,
    entries: BTreeMap<Vec<u8>, Vec<Version>>,
}

#[derive(Debug, Serialize)]
struct DbInfo<'a> {
    path: &'a Path,
    read_only: bool,
    keys: usize,
    versions: usize,
    dirty: bool,
}

pub struct FileDb {
    dir: PathBuf,
    read_only: bool,
    entries: RwLock<BTreeMap<Vec<u8>, Vec<Version>>>,
    dirty: AtomicBool,
    closed: AtomicBool,
    section: Mutex<()>,
}

impl FileDb {
    /// Open the database in `dir`.
    ///
    /// A writable database creates `dir` when missing; a read-only one
    /// requires an existing data file.
    pub fn open(dir: &Path, read_only: bool) -> Result<Self> {
        if !read_only {
            std::fs::create_dir_all(dir)?;
        }
        let data_path = dir.join(DATA_FILE);
        let entries = if data_path.exists() || read_only {
            load_entries(&data_path)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            read_only,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            section: Mutex::new(()),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PlanBError::AlreadyClosed(self.dir.display().to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(PlanBError::Unsupported("write to read-only db"));
        }
        Ok(())
    }

    /// Write entries to `data.bin` via temp file + rename.
    fn persist(&self, entries: &BTreeMap<Vec<u8>, Vec<Version>>) -> Result<()> {
        let tmp = self.dir.join(TMP_FILE);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(
                &mut writer,
                &DbFileRef {
                    format_version: FORMAT_VERSION,
                    entries,
                },
            )?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(DATA_FILE))?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn persist_if_dirty(&self) -> Result<()> {
        if !self.read_only && self.dirty.load(Ordering::Acquire) {
            let entries = self.entries.read();
            self.persist(&entries)?;
        }
        Ok(())
    }
}

/// Borrowing twin of `DbFile` for serialization without cloning.
#[derive(Serialize)]
struct DbFileRef<'a> {
    format_version: u32,
    entries: &'a BTreeMap<Vec<u8>, Vec<Version>>,
}

fn load_entries(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<Version>>> {
    let reader = BufReader::new(File::open(path)?);
    let file: DbFile = bincode::deserialize_from(reader)?;
    if file.format_version != FORMAT_VERSION {
        return Err(PlanBError::InvalidFormat(format!(
            "{}: unsupported format version {}",
            path.display(),
            file.format_version
        )));
    }
    Ok(file.entries)
}

/// Insert or replace the version at `time_ms`, keeping versions sorted.
fn put_version(versions: &mut Vec<Version>, time_ms: i64, value: Vec<u8>) {
    match versions.binary_search_by_key(&time_ms, |v| v.time_ms) {
        Ok(i) => versions[i].value = value,
        Err(i) => versions.insert(i, Version { time_ms, value }),
    }
}

fn value_at(versions: &[Version], effective_time_ms: i64) -> Option<&Vec<u8>> {
    let idx = versions.partition_point(|v| v.time_ms <= effective_time_ms);
    if idx == 0 {
        None
    } else {
        Some(&versions[idx - 1].value)
    }
}

impl Db for FileDb {
    fn path(&self) -> &Path {
        &self.dir
    }

    fn get(&self, key: &[u8], effective_time_ms: i64) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .and_then(|versions| value_at(versions, effective_time_ms))
            .cloned())
    }

    fn search(&self, prefix: &[u8], effective_time_ms: i64) -> Result<Vec<KeyValue>> {
        self.check_open()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, versions)| {
                value_at(versions, effective_time_ms).map(|v| (k.clone(), v.clone()))
            })
            .collect())
    }

    fn insert(&self, key: &[u8], value: &[u8], time_ms: i64) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write();
        put_version(entries.entry(key.to_vec()).or_default(), time_ms, value.to_vec());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn write(&self, writer: DbWriter) -> Result<usize> {
        self.check_writable()?;
        let written = writer.puts.len();
        let mut entries = self.entries.write();
        for (key, value, time_ms) in writer.puts {
            put_version(entries.entry(key).or_default(), time_ms, value);
        }
        if written > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(written)
    }

    fn merge(&self, source_dir: &Path) -> Result<u64> {
        self.check_writable()?;
        let source = load_entries(&source_dir.join(DATA_FILE))?;
        let mut merged = 0u64;
        let mut entries = self.entries.write();
        for (key, versions) in source {
            let target = entries.entry(key).or_default();
            for v in versions {
                put_version(target, v.time_ms, v.value);
                merged += 1;
            }
        }
        if merged > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(merged)
    }

    fn delete_old_data(&self, cutoff_ms: i64) -> Result<u64> {
        self.check_writable()?;
        let mut removed = 0u64;
        let mut entries = self.entries.write();
        entries.retain(|_, versions| {
            let before = versions.len();
            versions.retain(|v| v.time_ms >= cutoff_ms);
            removed += (before - versions.len()) as u64;
            !versions.is_empty()
        });
        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    fn condense(&self, cutoff_ms: i64) -> Result<u64> {
        self.check_writable()?;
        let mut removed = 0u64;
        let mut entries = self.entries.write();
        for versions in entries.values_mut() {
            let before = versions.len();
            let mut kept: Vec<Version> = Vec::with_capacity(before);
            for v in versions.drain(..) {
                let redundant = v.time_ms < cutoff_ms
                    && kept.last().map_or(false, |prev| prev.value == v.value);
                if !redundant {
                    kept.push(v);
                }
            }
            removed += (before - kept.len()) as u64;
            *versions = kept;
        }
        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    fn compact(&self) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write();
        entries.retain(|_, versions| !versions.is_empty());
        self.persist(&entries)
    }

    fn write_snapshot(&self, dest_dir: &Path) -> Result<()> {
        self.check_open()?;
        self.persist_if_dirty()?;
        std::fs::create_dir_all(dest_dir)?;
        let data_path = self.dir.join(DATA_FILE);
        if data_path.exists() {
            std::fs::copy(&data_path, dest_dir.join(DATA_FILE))?;
        } else {
            // Never persisted: write an empty database so the copy opens.
            let entries = self.entries.read();
            let mut writer = BufWriter::new(File::create(dest_dir.join(DATA_FILE))?);
            bincode::serialize_into(
                &mut writer,
                &DbFileRef {
                    format_version: FORMAT_VERSION,
                    entries: &entries,
                },
            )?;
            writer.flush()?;
        }
        Ok(())
    }

    fn lock(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.check_open()?;
        let _section = self.section.lock();
        f()
    }

    fn count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.entries.read().len() as u64)
    }

    fn info_string(&self) -> Result<String> {
        self.check_open()?;
        let entries = self.entries.read();
        let info = DbInfo {
            path: &self.dir,
            read_only: self.read_only,
            keys: entries.len(),
            versions: entries.values().map(Vec::len).sum(),
            dirty: self.dirty.load(Ordering::Acquire),
        };
        Ok(serde_json::to_string(&info)?)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PlanBError::AlreadyClosed(self.dir.display().to_string()));
        }
        self.persist_if_dirty()?;
        self.entries.write().clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Opens [`FileDb`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDbFactory;

impl DbFactory for FileDbFactory {
    fn open(&self, dir: &Path, read_only: bool) -> Result<Arc<dyn Db>> {
        Ok(Arc::new(FileDb::open(dir, read_only)?))
    }
}
