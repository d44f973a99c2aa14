//! Drop-off directory for parts handed over by other processes.
//!
//! ```text
//! receive/
//! +-- <create_time_ms>_<owner_id>_<hash>/      # complete, awaiting verify
//! +-- <create_time_ms>_<owner_id>_<hash>.tmp/  # copy in progress
//! ```
//!
//! The entry name is the part's [`FileDescriptor`]. A running node verifies
//! each complete entry and moves it into the staging store, which then owns
//! its ordering. Entries that fail verification are discarded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ConfigProvider;
use crate::descriptor::FileDescriptor;
use crate::error::{PlanBError, Result};
use crate::staging::{copy_recursive, StagingFileStore};
use crate::worker::Worker;

const TMP_SUFFIX: &str = ".tmp";

pub struct ReceiveDir {
    dir: PathBuf,
    staging: Arc<StagingFileStore>,
}

impl ReceiveDir {
    /// Open `dir`, discarding copies interrupted by a crash.
    pub fn open(dir: &Path, staging: Arc<StagingFileStore>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!(path = %entry.path().display(), "discarding incomplete received part");
                remove_path(&entry.path())?;
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            staging,
        })
    }

    /// Copy `part` into `dir` under its descriptor name. Safe to call while
    /// a node is ingesting from `dir`.
    pub fn drop_off(dir: &Path, descriptor: &FileDescriptor, part: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let name = descriptor.base_name();
        let dest = dir.join(&name);
        if dest.exists() {
            return Err(PlanBError::InvalidFormat(format!(
                "part {} was already received",
                name
            )));
        }

        let tmp = dir.join(format!("{}{}", name, TMP_SUFFIX));
        let copied = copy_recursive(part, &tmp).and_then(|()| Ok(std::fs::rename(&tmp, &dest)?));
        if let Err(e) = copied {
            let _ = remove_path(&tmp);
            return Err(e);
        }
        debug!(path = %dest.display(), "dropped off part");
        Ok(dest)
    }

    /// Verify and stage every complete entry, oldest first. Returns the
    /// number staged.
    pub fn ingest_pending(&self) -> Result<usize> {
        let mut pending: Vec<(FileDescriptor, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            match FileDescriptor::parse_base_name(&name) {
                Ok(descriptor) => pending.push((descriptor, entry.path())),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "ignoring unexpected entry"),
            }
        }
        pending.sort_by(|a, b| {
            (a.0.create_time_ms, a.0.owner_id, &a.1).cmp(&(b.0.create_time_ms, b.0.owner_id, &b.1))
        });

        let mut staged = 0;
        for (descriptor, path) in pending {
            match self.staging.receive(&descriptor, &path) {
                Ok(file) => {
                    debug!(id = file.id(), part = %descriptor.base_name(), "staged received part");
                    staged += 1;
                }
                Err(e @ PlanBError::HashMismatch { .. }) => {
                    warn!(path = %path.display(), error = %e, "discarding corrupt part");
                    remove_path(&path)?;
                }
                Err(e) => return Err(e),
            }
        }
        if staged > 0 {
            info!(staged, "received parts");
        }
        Ok(staged)
    }

    /// Poll for new entries every `merge_poll_interval` until stopped.
    pub fn start(self: Arc<Self>, config: ConfigProvider) -> Result<Worker> {
        Worker::spawn("planb-receive", move |stop| loop {
            if let Err(e) = self.ingest_pending() {
                warn!(error = %e, "failed to ingest received parts");
            }
            if stop.wait(config().merge_poll_interval()) {
                break;
            }
        })
    }
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
