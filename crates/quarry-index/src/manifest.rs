//! On-disk pass bookkeeping: the file hash cache and the pass lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::snapshot;

pub const FILE_HASHES_FILE: &str = "file_hashes.json";
pub const LOCK_FILE: &str = "index.lock";

/// Persisted map of file path to content hash from the last completed pass.
///
/// This is purely an optimization. Clearing it is always safe and merely
/// forces the next pass to re-parse and re-diff every file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileHashCache {
    pub files: HashMap<String, String>,
}

impl FileHashCache {
    pub fn load(dir: &Path) -> Self {
        snapshot::load_or_default(&dir.join(FILE_HASHES_FILE))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        snapshot::write_json(&dir.join(FILE_HASHES_FILE), self)
    }

    /// Whether `path` carries the same hash as in the last completed pass.
    pub fn unchanged(&self, path: &str, hash: &str) -> bool {
        self.files.get(path).map(|h| h == hash).unwrap_or(false)
    }

    /// Replace the whole cache with the hashes from the pass that just ran.
    pub fn replace(&mut self, files: HashMap<String, String>) {
        self.files = files;
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Marker file held for the duration of an indexing pass.
///
/// Present-at-startup means the previous process died mid-pass, so the fast
/// path (the file hash cache) can no longer be trusted.
#[derive(Debug)]
pub struct PassLock {
    path: PathBuf,
}

impl PassLock {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE)
    }

    /// Whether a lock left behind by an earlier process exists.
    pub fn is_stale(dir: &Path) -> bool {
        Self::path_in(dir).exists()
    }

    /// Remove a stale lock after recovery.
    pub fn clear_stale(dir: &Path) -> Result<()> {
        let path = Self::path_in(dir);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove stale lock {path:?}"))?;
            warn!(path = %path.display(), "cleared stale pass lock");
        }
        Ok(())
    }

    /// Write the lock marker for a pass that is about to start.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {parent:?}"))?;
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        std::fs::write(&path, stamp.to_string())
            .with_context(|| format!("failed to write pass lock {path:?}"))?;
        debug!(path = %path.display(), "acquired pass lock");
        Ok(Self { path })
    }

    /// Release the lock after the pass committed all its snapshots.
    ///
    /// Deliberately not a `Drop` impl: an abnormal exit must leave the
    /// marker behind so the next startup notices.
    pub fn release(self) -> Result<()> {
        std::fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove pass lock {:?}", self.path))?;
        debug!(path = %self.path.display(), "released pass lock");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_cache_round_trip() {
        let dir = tempdir().unwrap();
        let mut cache = FileHashCache::default();
        cache.replace(HashMap::from([
            ("a.rs".to_string(), "h1".to_string()),
            ("b.rs".to_string(), "h2".to_string()),
        ]));
        cache.save(dir.path()).unwrap();

        let loaded = FileHashCache::load(dir.path());
        assert_eq!(loaded.len(), 2);
        assert!(loaded.unchanged("a.rs", "h1"));
        assert!(!loaded.unchanged("a.rs", "h9"));
        assert!(!loaded.unchanged("missing.rs", "h1"));
    }

    #[test]
    fn test_hash_cache_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(FileHashCache::load(dir.path()).is_empty());
    }

    #[test]
    fn test_lock_lifecycle() {
        let dir = tempdir().unwrap();
        assert!(!PassLock::is_stale(dir.path()));

        let lock = PassLock::acquire(dir.path()).unwrap();
        assert!(PassLock::is_stale(dir.path()));

        lock.release().unwrap();
        assert!(!PassLock::is_stale(dir.path()));
    }

    #[test]
    fn test_stale_lock_survives_without_release() {
        let dir = tempdir().unwrap();
        {
            let _lock = PassLock::acquire(dir.path()).unwrap();
            // Dropped without release, simulating a crash.
        }
        assert!(PassLock::is_stale(dir.path()));

        PassLock::clear_stale(dir.path()).unwrap();
        assert!(!PassLock::is_stale(dir.path()));
    }

    #[test]
    fn test_clear_stale_tolerates_absent_lock() {
        let dir = tempdir().unwrap();
        assert!(PassLock::clear_stale(dir.path()).is_ok());
    }
}
