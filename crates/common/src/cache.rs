//! Local content cache.
//!
//! The cache is a plain directory tree under `<cache_dir>/files`. The FUSE
//! handler serves reads and writes straight out of it, the sync engine
//! materializes downloads into it and reads uploads from it. Writes go
//! through a temp file in the destination directory so a crash never leaves
//! a half-written file at a logical path.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::{Result, SyncError};

/// Per-path advisory locks.
///
/// Both the handler and the engine take the lock for a logical path around
/// compound read-hash or write-rename sequences. Lock handles are `Arc`ed
/// so a guard can outlive the map lookup.
#[derive(Debug, Default)]
struct PathLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn acquire(&self, logical: &str) -> parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()> {
        let lock = {
            let mut map = self.locks.lock();
            Arc::clone(map.entry(logical.to_string()).or_default())
        };
        lock.lock_arc()
    }
}

/// Root of the on-disk content cache plus the per-path lock table.
#[derive(Debug)]
pub struct CacheDir {
    root: PathBuf,
    locks: PathLocks,
}

impl CacheDir {
    /// Opens (creating if needed) the content cache under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: PathLocks::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a logical path (as stored in metadata, leading slash optional)
    /// to its absolute location inside the cache.
    ///
    /// Rejects parent-directory components so a hostile key listed from the
    /// bucket can never escape the cache root.
    pub fn abs(&self, logical: &str) -> Result<PathBuf> {
        let relative = logical.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(self.root.clone());
        }
        let candidate = Path::new(relative);
        for component in candidate.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(SyncError::InvalidPath(logical.to_string()));
                }
            }
        }
        Ok(self.root.join(candidate))
    }

    /// Takes the advisory lock for a logical path. The guard is held across
    /// whatever compound operation the caller performs.
    pub fn lock(&self, logical: &str) -> parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()> {
        self.locks.acquire(logical)
    }

    pub fn exists(&self, logical: &str) -> Result<bool> {
        Ok(self.abs(logical)?.exists())
    }

    pub fn read(&self, logical: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.abs(logical)?)?)
    }

    /// Writes content atomically: temp file in the destination directory,
    /// then rename over the logical path.
    pub fn write_atomic(&self, logical: &str, content: &[u8]) -> Result<()> {
        let dest = self.abs(logical)?;
        let parent = dest
            .parent()
            .ok_or_else(|| SyncError::InvalidPath(logical.to_string()))?;
        std::fs::create_dir_all(parent)?;
        let tmp = NamedTempFile::new_in(parent)?;
        std::fs::write(tmp.path(), content)?;
        tmp.persist(&dest).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }

    /// Removes the cached content for a path. Missing files are fine; the
    /// engine purges tombstones whether or not content was ever
    /// materialized locally.
    pub fn remove(&self, logical: &str) -> Result<()> {
        let path = self.abs(logical)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_dir(&self, logical: &str) -> Result<()> {
        let path = self.abs(logical)?;
        match std::fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_dir(&self, logical: &str) -> Result<()> {
        std::fs::create_dir_all(self.abs(logical)?)?;
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let dest = self.abs(to)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(self.abs(from)?, dest)?;
        Ok(())
    }

    pub fn size(&self, logical: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.abs(logical)?)?.len())
    }

    /// Modification time as seconds since the epoch, the granularity the
    /// metadata store and conflict resolution work in.
    pub fn mtime(&self, logical: &str) -> Result<i64> {
        let meta = std::fs::metadata(self.abs(logical)?)?;
        let mtime = meta
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(mtime)
    }
}
