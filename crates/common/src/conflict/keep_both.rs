//! Keep-both resolver.

use std::path::Path;

use super::types::{Conflict, Resolution};
use super::ConflictResolver;

/// Keep-both resolution (the default).
///
/// The remote version wins the original path; the local version is forked
/// to `<stem>@<device>-<mtime>.<ext>` and syncs from there as a new file.
/// The fork name is a pure function of the conflict, so every device that
/// observes the same divergence produces the same fork path and the
/// namespace converges without another round of conflicts.
///
/// # Example
///
/// `notes.txt` edited on `laptop` at mtime `1700000000` forks to
/// `notes@laptop-1700000000.txt`.
#[derive(Debug, Clone, Default)]
pub struct KeepBoth;

impl KeepBoth {
    pub fn new() -> Self {
        Self
    }

    /// Fork path for the losing local version.
    pub fn fork_path(path: &str, device: &str, mtime: i64) -> String {
        let as_path = Path::new(path);
        let stem = as_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        let ext = as_path.extension().and_then(|e| e.to_str());
        let device = if device.is_empty() { "unknown" } else { device };

        let name = match ext {
            Some(ext) => format!("{}@{}-{}.{}", stem, device, mtime, ext),
            None => format!("{}@{}-{}", stem, device, mtime),
        };

        match as_path.parent().and_then(|p| p.to_str()) {
            Some(parent) if !parent.is_empty() && parent != "/" => {
                format!("{}/{}", parent, name)
            }
            _ => format!("/{}", name),
        }
    }
}

impl ConflictResolver for KeepBoth {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        Resolution::ForkLocal {
            fork_path: Self::fork_path(&conflict.path, &conflict.device, conflict.local.mtime),
        }
    }

    fn name(&self) -> &'static str {
        "keep-both"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::types::VersionInfo;

    fn conflict(path: &str, device: &str, mtime: i64) -> Conflict {
        Conflict {
            path: path.to_string(),
            local: VersionInfo {
                hash: "aaa".to_string(),
                mtime,
            },
            remote: VersionInfo {
                hash: "bbb".to_string(),
                mtime: mtime + 5,
            },
            device: device.to_string(),
        }
    }

    #[test]
    fn test_fork_path_with_extension() {
        assert_eq!(
            KeepBoth::fork_path("/docs/notes.txt", "laptop", 1_700_000_000),
            "/docs/notes@laptop-1700000000.txt"
        );
    }

    #[test]
    fn test_fork_path_without_extension() {
        assert_eq!(
            KeepBoth::fork_path("/Makefile", "desktop", 42),
            "/Makefile@desktop-42"
        );
    }

    #[test]
    fn test_fork_path_at_root() {
        assert_eq!(
            KeepBoth::fork_path("/a.txt", "laptop", 7),
            "/a@laptop-7.txt"
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = KeepBoth::new();
        let a = resolver.resolve(&conflict("/docs/notes.txt", "laptop", 100));
        let b = resolver.resolve(&conflict("/docs/notes.txt", "laptop", 100));
        assert_eq!(a, b);
        assert_eq!(
            a,
            Resolution::ForkLocal {
                fork_path: "/docs/notes@laptop-100.txt".to_string()
            }
        );
    }
}
