//! Per-file sync metadata.
//!
//! Every logical path in the namespace has exactly one [`FileEntry`] whose
//! [`SyncState`] drives the sync engine. State transitions from handler and
//! engine race against each other; the compare-and-swap operation on
//! [`MetadataStore`] is what keeps them coherent.

mod store;

pub use store::{MetadataStore, StateCounts};

use serde::{Deserialize, Serialize};

/// Lifecycle of a synced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// Local content matches the last known remote version.
    Clean,
    /// Local edits not yet uploaded.
    LocallyModified,
    /// An upload worker owns this path.
    Uploading,
    /// A download worker owns this path.
    Downloading,
    /// The bucket holds a newer version than the cache.
    RemotelyModified,
    /// Divergent edits were detected and are awaiting (or underwent)
    /// resolution; the engine never overwrites a conflicted entry blindly.
    Conflicted,
    /// Deleted locally, deletion not yet propagated.
    Deleted,
    /// A delete worker owns this path; the entry is purged once the remote
    /// object is gone.
    Tombstoned,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Clean => "clean",
            SyncState::LocallyModified => "locally-modified",
            SyncState::Uploading => "uploading",
            SyncState::Downloading => "downloading",
            SyncState::RemotelyModified => "remotely-modified",
            SyncState::Conflicted => "conflicted",
            SyncState::Deleted => "deleted",
            SyncState::Tombstoned => "tombstoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(SyncState::Clean),
            "locally-modified" => Some(SyncState::LocallyModified),
            "uploading" => Some(SyncState::Uploading),
            "downloading" => Some(SyncState::Downloading),
            "remotely-modified" => Some(SyncState::RemotelyModified),
            "conflicted" => Some(SyncState::Conflicted),
            "deleted" => Some(SyncState::Deleted),
            "tombstoned" => Some(SyncState::Tombstoned),
            _ => None,
        }
    }

    /// Whether the scheduler should pick this entry up.
    pub fn needs_sync(&self) -> bool {
        matches!(
            self,
            SyncState::LocallyModified
                | SyncState::RemotelyModified
                | SyncState::Conflicted
                | SyncState::Deleted
        )
    }

    /// Whether a worker currently owns the path.
    pub fn in_flight(&self) -> bool {
        matches!(
            self,
            SyncState::Uploading | SyncState::Downloading | SyncState::Tombstoned
        )
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata row for one logical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Logical path, always with a leading slash.
    pub path: String,
    /// Hex SHA-256 of the plaintext content. Empty for directories and for
    /// remote discoveries not yet downloaded.
    pub local_hash: String,
    /// Version token (ETag) of the last remote version this device has
    /// seen. Empty means the path has never been uploaded; uploads of such
    /// entries use a create-only precondition.
    pub remote_version: String,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: i64,
    pub sync_state: SyncState,
    /// Name of the device that produced the current local content.
    pub device_origin: String,
    pub encrypted: bool,
    pub is_dir: bool,
    /// Consecutive failed sync attempts since the last success.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl FileEntry {
    /// Entry for content just created or modified through the filesystem.
    pub fn local_create(
        path: impl Into<String>,
        hash: impl Into<String>,
        size: u64,
        mtime: i64,
        device: impl Into<String>,
        encrypted: bool,
    ) -> Self {
        Self {
            path: path.into(),
            local_hash: hash.into(),
            remote_version: String::new(),
            size,
            mtime,
            sync_state: SyncState::LocallyModified,
            device_origin: device.into(),
            encrypted,
            is_dir: false,
            attempts: 0,
            last_error: None,
        }
    }

    /// Entry for an object discovered in the bucket that this device has
    /// never seen.
    pub fn remote_discovery(
        path: impl Into<String>,
        version: impl Into<String>,
        size: u64,
        mtime: i64,
        encrypted: bool,
    ) -> Self {
        Self {
            path: path.into(),
            local_hash: String::new(),
            remote_version: version.into(),
            size,
            mtime,
            sync_state: SyncState::RemotelyModified,
            device_origin: String::new(),
            encrypted,
            is_dir: false,
            attempts: 0,
            last_error: None,
        }
    }

    /// Entry for a directory created through the filesystem. Directories
    /// are local namespace structure only and never sync as objects.
    pub fn directory(path: impl Into<String>, mtime: i64, device: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            local_hash: String::new(),
            remote_version: String::new(),
            size: 0,
            mtime,
            sync_state: SyncState::Clean,
            device_origin: device.into(),
            encrypted: false,
            is_dir: true,
            attempts: 0,
            last_error: None,
        }
    }
}

/// A device known to have mounted this bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub last_seen: i64,
    pub is_local: bool,
}

/// One resolved conflict, kept for auditing. The losing version's hash is
/// recorded so it can be identified even after its content is replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictAudit {
    pub path: String,
    pub winner: String,
    pub loser_hash: String,
    pub policy: String,
    pub resolved_at: i64,
}
