//! File identity for transferred part and snapshot files.
//!
//! A `FileDescriptor` names a file independently of where it currently lives:
//! creation time, owning id and content hash. The hash is a BLAKE3 digest of
//! the file, or, for a directory, of every file below it visited in sorted
//! order (relative path + length + content), so the same tree always hashes
//! to the same value wherever it is stored.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PlanBError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub create_time_ms: i64,
    pub owner_id: i64,
    pub content_hash: String,
}

impl FileDescriptor {
    pub fn new(create_time_ms: i64, owner_id: i64, content_hash: String) -> Self {
        Self {
            create_time_ms,
            owner_id,
            content_hash,
        }
    }

    /// Build a descriptor for an existing file or directory, hashing it now.
    pub fn for_path(create_time_ms: i64, owner_id: i64, path: &Path) -> Result<Self> {
        Ok(Self::new(create_time_ms, owner_id, hash_path(path)?))
    }

    /// On-disk name: `<create_time_ms>_<owner_id>_<hash>`.
    pub fn base_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.create_time_ms, self.owner_id, self.content_hash
        )
    }

    pub fn parse_base_name(name: &str) -> Result<Self> {
        let invalid = || PlanBError::InvalidFormat(format!("bad descriptor name '{}'", name));

        let mut parts = name.splitn(3, '_');
        let create_time_ms = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let owner_id = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let content_hash = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

        Ok(Self::new(create_time_ms, owner_id, content_hash.to_string()))
    }
}

// ── Hashing ─────────────────────────────────────────────────────────

/// Lowercase hex BLAKE3 digest of a file or directory tree.
pub fn hash_path(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    if path.is_dir() {
        let mut files = Vec::new();
        collect_files(path, path, &mut files)?;
        files.sort();
        for rel in files {
            let full = path.join(&rel);
            let len = std::fs::metadata(&full)?.len();
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(&[0]);
            hasher.update(&len.to_le_bytes());
            io::copy(&mut File::open(&full)?, &mut hasher)?;
        }
    } else {
        io::copy(&mut File::open(path)?, &mut hasher)?;
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Check that `path` still matches the descriptor's content hash.
pub fn verify(descriptor: &FileDescriptor, path: &Path) -> Result<()> {
    let actual = hash_path(path)?;
    if actual != descriptor.content_hash {
        return Err(PlanBError::HashMismatch {
            expected: descriptor.content_hash.clone(),
            actual,
        });
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}
