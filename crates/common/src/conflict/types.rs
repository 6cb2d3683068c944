//! Conflict data types.

use serde::{Deserialize, Serialize};

/// One side of a divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Hex SHA-256 of the plaintext content.
    pub hash: String,
    /// Seconds since the epoch.
    pub mtime: i64,
}

/// A detected divergence: both the local cache and the bucket changed the
/// same path since the last common version.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// Logical path, leading slash.
    pub path: String,
    pub local: VersionInfo,
    pub remote: VersionInfo,
    /// Local device name, used to label forked copies.
    pub device: String,
}

/// What a resolver decided to do with a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local content stays; the remote version is overwritten on the next
    /// upload.
    KeepLocal,
    /// Remote content replaces the local cache.
    KeepRemote,
    /// Remote content takes the original path; local content moves to
    /// `fork_path` and syncs as a new file.
    ForkLocal { fork_path: String },
}
