//! Last-write-wins resolver.

use super::types::{Conflict, Resolution};
use super::ConflictResolver;

/// Last-write-wins resolution.
///
/// The side with the newer modification time wins. Equal timestamps are
/// broken by comparing content hashes, with the lexicographically greater
/// hash winning, so independent devices reach the same verdict without
/// coordinating. The loser's hash goes to the conflict audit log before its
/// content is replaced.
#[derive(Debug, Clone, Default)]
pub struct LastWriteWins;

impl LastWriteWins {
    pub fn new() -> Self {
        Self
    }
}

impl ConflictResolver for LastWriteWins {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        if conflict.local.mtime > conflict.remote.mtime {
            return Resolution::KeepLocal;
        }
        if conflict.local.mtime < conflict.remote.mtime {
            return Resolution::KeepRemote;
        }
        if conflict.local.hash > conflict.remote.hash {
            Resolution::KeepLocal
        } else {
            Resolution::KeepRemote
        }
    }

    fn name(&self) -> &'static str {
        "last-write-wins"
    }
}
