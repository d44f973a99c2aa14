//! MergeProcessor - drains the staging store into local shards
//!
//! A part is a directory with one database directory per map:
//!
//! ```text
//! part/
//! +-- hosts/data.bin
//! +-- users/data.bin
//! ```
//!
//! Parts are merged strictly in staging id order. A part is deleted only
//! after every map in it merged. A transient failure (I/O) retries the same
//! id after the poll interval; merging is idempotent, so maps that already
//! merged before a failure are harmless to merge again. A part that can
//! never merge (not a directory, bad map name, corrupt data) is moved to
//! `failed/` and the processor moves on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{ConfigProvider, ShardDoc};
use crate::db::DATA_FILE;
use crate::error::{PlanBError, Result};
use crate::shard::ShardManager;
use crate::staging::{SequentialFile, StagingFileStore};
use crate::worker::{StopSignal, Worker};

pub struct MergeProcessor {
    config: ConfigProvider,
    staging: Arc<StagingFileStore>,
    manager: Arc<ShardManager>,
}

impl MergeProcessor {
    pub fn new(
        config: ConfigProvider,
        staging: Arc<StagingFileStore>,
        manager: Arc<ShardManager>,
    ) -> Self {
        Self {
            config,
            staging,
            manager,
        }
    }

    /// Merge every map directory of one staged part.
    pub fn merge_part(&self, file: &SequentialFile) -> Result<usize> {
        let part = file.part_path();
        if !part.is_dir() {
            return Err(PlanBError::InvalidFormat(format!(
                "staged part {} is not a directory",
                part.display()
            )));
        }

        let mut maps: Vec<(String, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&part)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                maps.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        maps.sort();

        // Reject the whole part before merging any of it.
        for (name, dir) in &maps {
            ShardDoc::validate_name(name)?;
            if !dir.join(DATA_FILE).is_file() {
                return Err(PlanBError::InvalidFormat(format!(
                    "map {} in staged part {} has no data file",
                    name,
                    part.display()
                )));
            }
        }

        for (name, dir) in &maps {
            self.manager.merge(name, dir)?;
        }
        Ok(maps.len())
    }

    /// Merge and delete everything currently staged. Returns parts merged.
    ///
    /// Parts that can never merge are quarantined and skipped; a transient
    /// failure stops here, leaving the part staged.
    pub fn merge_available(&self) -> Result<usize> {
        let mut merged = 0;
        while !self.staging.is_empty() {
            let id = self.staging.first_pending_id();
            let Some(file) = self.staging.await_next_timeout(id, Duration::ZERO)? else {
                break;
            };
            match self.merge_part(&file) {
                Ok(_) => {
                    self.staging.delete(&file)?;
                    merged += 1;
                }
                Err(e) if e.is_permanent() => self.quarantine(&file, &e)?,
                Err(e) => return Err(e),
            }
        }
        Ok(merged)
    }

    fn quarantine(&self, file: &SequentialFile, cause: &PlanBError) -> Result<()> {
        let dest = self
            .staging
            .quarantine(file, &self.manager.paths().failed_dir())?;
        error!(
            id = file.id(),
            error = %cause,
            moved_to = %dest.display(),
            "staged part can never merge, quarantined"
        );
        Ok(())
    }

    /// Run the merge loop on a background thread.
    pub fn start(self: Arc<Self>) -> Result<Worker> {
        Worker::spawn("planb-merge", move |stop| self.run(&stop))
    }

    fn run(&self, stop: &StopSignal) {
        let mut next = self.staging.first_pending_id();
        info!(next, "merge processor started");

        while !stop.is_stopped() {
            let poll = (self.config)().merge_poll_interval();
            match self.staging.await_next_timeout(next, poll) {
                Ok(Some(file)) => match self.merge_part(&file) {
                    Ok(maps) => {
                        if let Err(e) = self.staging.delete(&file) {
                            warn!(id = file.id(), error = %e, "failed to delete merged part");
                        }
                        debug!(id = file.id(), maps, "merged staged part");
                        next = file.id() + 1;
                    }
                    Err(e) if e.is_permanent() => match self.quarantine(&file, &e) {
                        Ok(()) => next = file.id() + 1,
                        Err(move_err) => {
                            warn!(id = file.id(), error = %move_err, "failed to quarantine part, will retry");
                            if stop.wait(poll) {
                                break;
                            }
                        }
                    },
                    Err(e) => {
                        warn!(id = file.id(), error = %e, "merge failed, will retry");
                        if stop.wait(poll) {
                            break;
                        }
                    }
                },
                Ok(None) => {}
                Err(PlanBError::StagedFileNotFound(id)) => {
                    next = self.staging.first_pending_id().max(id + 1);
                    debug!(missing = id, next, "skipping missing staged id");
                }
                Err(e) => {
                    warn!(id = next, error = %e, "failed to read staged part");
                    if stop.wait(poll) {
                        break;
                    }
                }
            }
        }
        info!("merge processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanBConfig;
    use crate::db::{Db, FileDb, FileDbFactory};
    use crate::descriptor::FileDescriptor;
    use crate::paths::StatePaths;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    struct Node {
        _dir: TempDir,
        staging: Arc<StagingFileStore>,
        manager: Arc<ShardManager>,
        processor: Arc<MergeProcessor>,
    }

    fn node() -> Node {
        let dir = tempdir().unwrap();
        let config = PlanBConfig {
            path: dir.path().to_path_buf(),
            merge_poll_interval_ms: 20,
            ..PlanBConfig::default()
        }
        .fixed();
        let paths = StatePaths::new(dir.path());
        let staging = Arc::new(StagingFileStore::open(&paths.staging_dir()).unwrap());
        let manager = Arc::new(ShardManager::new(
            Arc::clone(&config),
            paths,
            None,
            Arc::new(FileDbFactory),
        ));
        let processor = Arc::new(MergeProcessor::new(
            config,
            Arc::clone(&staging),
            Arc::clone(&manager),
        ));
        Node {
            _dir: dir,
            staging,
            manager,
            processor,
        }
    }

    /// Build a part in `root/<label>` with one row per map.
    fn stage(node: &Node, root: &Path, label: &str, rows: &[(&str, &str, &str, i64)]) {
        let part = root.join(label);
        for (map, k, v, t) in rows {
            let db = FileDb::open(&part.join(map), false).unwrap();
            db.insert(k.as_bytes(), v.as_bytes(), *t).unwrap();
            db.close().unwrap();
        }
        let d = FileDescriptor::for_path(0, 1, &part).unwrap();
        node.staging.add(&d, &part).unwrap();
    }

    #[test]
    fn test_merge_available_in_order() {
        let node = node();
        let src = tempdir().unwrap();
        stage(&node, src.path(), "p0", &[("hosts", "k", "first", 10)]);
        stage(&node, src.path(), "p1", &[("hosts", "k", "second", 10), ("users", "u", "x", 10)]);

        assert_eq!(node.processor.merge_available().unwrap(), 2);
        assert!(node.staging.is_empty());
        // Later parts win for the same key and time.
        assert_eq!(node.manager.get("hosts", b"k", 100).unwrap(), Some(b"second".to_vec()));
        assert_eq!(node.manager.shard_names(), vec!["hosts".to_string(), "users".to_string()]);
    }

    /// Stage a plain file where a part directory is expected.
    fn stage_bad(node: &Node, root: &Path) {
        let file = root.join("not-a-dir");
        std::fs::write(&file, b"junk").unwrap();
        let d = FileDescriptor::for_path(0, 1, &file).unwrap();
        node.staging.add(&d, &file).unwrap();
    }

    fn failed_entries(node: &Node) -> usize {
        std::fs::read_dir(node.manager.paths().failed_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn test_bad_part_is_quarantined() {
        let node = node();
        let src = tempdir().unwrap();
        stage_bad(&node, src.path());
        stage(&node, src.path(), "p1", &[("hosts", "k", "v", 10)]);

        assert_eq!(node.processor.merge_available().unwrap(), 1);
        assert!(node.staging.is_empty());
        assert_eq!(failed_entries(&node), 1);
        assert_eq!(node.manager.get("hosts", b"k", 100).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_part_with_bad_map_merges_nothing() {
        let node = node();
        let src = tempdir().unwrap();
        let part = src.path().join("half");
        let db = FileDb::open(&part.join("hosts"), false).unwrap();
        db.insert(b"k", b"v", 10).unwrap();
        db.close().unwrap();
        std::fs::create_dir_all(part.join("users")).unwrap();
        let d = FileDescriptor::for_path(0, 1, &part).unwrap();
        node.staging.add(&d, &part).unwrap();

        assert_eq!(node.processor.merge_available().unwrap(), 0);
        assert_eq!(failed_entries(&node), 1);
        assert!(node.manager.shard_names().is_empty());
    }

    #[test]
    fn test_background_loop_skips_bad_part() {
        let node = node();
        let src = tempdir().unwrap();
        stage_bad(&node, src.path());
        stage(&node, src.path(), "p1", &[("hosts", "k", "v", 10)]);

        let worker = Arc::clone(&node.processor).start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !node.staging.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.stop();

        assert!(node.staging.is_empty());
        assert_eq!(failed_entries(&node), 1);
        assert_eq!(node.manager.get("hosts", b"k", 100).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_background_loop_merges_new_parts() {
        let node = node();
        let worker = Arc::clone(&node.processor).start().unwrap();
        let src = tempdir().unwrap();
        for i in 0..5 {
            stage(&node, src.path(), &format!("p{}", i), &[("hosts", "k", format!("v{}", i).as_str(), 10)]);
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while !node.staging.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.stop();

        assert!(node.staging.is_empty());
        assert_eq!(node.manager.get("hosts", b"k", 100).unwrap(), Some(b"v4".to_vec()));
    }
}
