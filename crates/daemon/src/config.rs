//! On-disk daemon configuration.
//!
//! Loaded from `~/.config/sharebox/config.toml` by default. The file is
//! split into the remote bucket, sync tuning, and encryption sections; what
//! the core crates see is the fully-resolved [`BucketConfig`] and
//! [`SyncConfig`] pair.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use common::{EncryptionConfig, SyncConfig};
use store::BucketConfig;

/// Top-level config file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    pub bucket: BucketConfig,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    /// Where cached content, metadata and quarantine live.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Default mount point; `mount --mount-point` overrides it.
    #[serde(default)]
    pub mount_point: String,
    /// Device label used for conflict forks. Defaults to the hostname.
    #[serde(default)]
    pub device_name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            mount_point: String::new(),
            device_name: String::new(),
        }
    }
}

fn default_cache_dir() -> String {
    "~/.local/share/sharebox".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub sync_interval_secs: u64,
    pub list_interval_secs: u64,
    pub max_file_size: u64,
    pub excluded_patterns: Vec<String>,
    pub workers: usize,
    pub max_attempts: u32,
    pub drain_timeout_secs: u64,
    pub conflict_policy: common::ConflictPolicy,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            sync_interval_secs: defaults.sync_interval_secs,
            list_interval_secs: defaults.list_interval_secs,
            max_file_size: defaults.max_file_size,
            excluded_patterns: vec![
                "*.tmp".to_string(),
                "*.swp".to_string(),
                ".DS_Store".to_string(),
            ],
            workers: defaults.workers,
            max_attempts: defaults.max_attempts,
            drain_timeout_secs: defaults.drain_timeout_secs,
            conflict_policy: defaults.conflict_policy,
        }
    }
}

impl AppConfig {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sharebox")
            .join("config.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Resolves the file into what the core crates consume, expanding `~`
    /// and applying the mount-point override.
    pub fn resolve(&self, mount_point_override: Option<&Path>) -> Result<(BucketConfig, SyncConfig)> {
        let mount_point = match mount_point_override {
            Some(p) => p.to_path_buf(),
            None if !self.app.mount_point.is_empty() => expand_tilde(&self.app.mount_point),
            None => bail!("no mount point configured; set [app].mount_point or pass --mount-point"),
        };

        let device_name = if self.app.device_name.is_empty() {
            hostname()
        } else {
            self.app.device_name.clone()
        };

        let sync = SyncConfig {
            cache_dir: expand_tilde(&self.app.cache_dir),
            mount_point,
            sync_interval_secs: self.sync.sync_interval_secs,
            list_interval_secs: self.sync.list_interval_secs,
            max_file_size: self.sync.max_file_size,
            excluded_patterns: self.sync.excluded_patterns.clone(),
            workers: self.sync.workers,
            max_attempts: self.sync.max_attempts,
            drain_timeout_secs: self.sync.drain_timeout_secs,
            conflict_policy: self.sync.conflict_policy,
            device_name,
            encryption: self.encryption.clone(),
        };
        Ok((self.bucket.clone(), sync))
    }
}

/// Persisted layout under the cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    pub files_dir: PathBuf,
    pub metadata_db: PathBuf,
    pub quarantine_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_dir: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_dir: &Path) -> Self {
        let state = cache_dir.join("state");
        Self {
            files_dir: cache_dir.join("files"),
            metadata_db: state.join("metadata.db"),
            quarantine_dir: state.join("quarantine"),
            pid_file: state.join("sharebox.pid"),
            log_dir: state.join("logs"),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "sharebox-device".to_string())
}
