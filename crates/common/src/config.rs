//! Resolved configuration consumed by the sync core.
//!
//! Loading and merging the on-disk config file happens in the daemon crate;
//! the core only ever sees this fully-resolved form.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// How divergent concurrent edits are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Keep both versions; the local one is forked to a conflict-suffixed
    /// path and the remote one takes the original path.
    #[default]
    KeepBoth,
    /// Newest modification time wins; the loser is recorded in the conflict
    /// audit log before being replaced.
    LastWriteWins,
}

/// Client-side encryption settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub password: String,
    /// Only `aes-256-gcm` is supported; kept in the config so a future
    /// algorithm change is explicit rather than silent.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

fn default_algorithm() -> String {
    "aes-256-gcm".to_string()
}

/// Resolved sync settings shared by the handler and the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub cache_dir: PathBuf,
    pub mount_point: PathBuf,
    /// Cadence of the dirty-entry scan.
    pub sync_interval_secs: u64,
    /// Cadence of the full bucket listing that discovers foreign changes.
    pub list_interval_secs: u64,
    pub max_file_size: u64,
    pub excluded_patterns: Vec<String>,
    /// Bound on concurrent per-path sync operations.
    pub workers: usize,
    /// Attempts per path before the failure is surfaced in `status` and the
    /// path stops being scheduled automatically.
    pub max_attempts: u32,
    /// How long unmount waits for in-flight work before abandoning it.
    pub drain_timeout_secs: u64,
    pub conflict_policy: ConflictPolicy,
    pub device_name: String,
    pub encryption: EncryptionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::new(),
            mount_point: PathBuf::new(),
            sync_interval_secs: 30,
            list_interval_secs: 300,
            max_file_size: 1024 * 1024 * 1024,
            excluded_patterns: Vec::new(),
            workers: 4,
            max_attempts: 5,
            drain_timeout_secs: 30,
            conflict_policy: ConflictPolicy::KeepBoth,
            device_name: String::new(),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// Compiled exclusion patterns.
///
/// A pattern matches either the full logical path or the file name, so
/// `*.tmp` excludes temp files anywhere in the tree without requiring
/// `**/` prefixes in the config.
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    set: GlobSet,
}

impl ExclusionFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| SyncError::Config(format!("bad exclusion pattern {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| SyncError::Config(format!("bad exclusion patterns: {e}")))?;
        Ok(Self { set })
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSetBuilder::new().build().expect("empty glob set"),
        }
    }

    /// Whether a logical path (leading slash optional) must be skipped by
    /// the sync engine.
    pub fn is_excluded(&self, logical: &str) -> bool {
        let relative = logical.trim_start_matches('/');
        if self.set.is_match(Path::new(relative)) {
            return true;
        }
        Path::new(relative)
            .file_name()
            .map(|name| self.set.is_match(Path::new(name)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_patterns_match_anywhere() {
        let filter = ExclusionFilter::new(&["*.tmp".to_string(), ".DS_Store".to_string()]).unwrap();
        assert!(filter.is_excluded("/foo.tmp"));
        assert!(filter.is_excluded("/deep/nested/foo.tmp"));
        assert!(filter.is_excluded("/docs/.DS_Store"));
        assert!(!filter.is_excluded("/foo.txt"));
    }

    #[test]
    fn test_path_patterns() {
        let filter = ExclusionFilter::new(&["build/**".to_string()]).unwrap();
        assert!(filter.is_excluded("/build/out.o"));
        assert!(!filter.is_excluded("/src/build.rs"));
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        assert!(ExclusionFilter::new(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_default_policy_is_keep_both() {
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::KeepBoth);
    }
}
