//! Conflict resolution for divergent edits.
//!
//! When the engine finds that both the local cache and the bucket changed a
//! path since their last common version, it asks a resolver what to do.
//! Identical content on both sides never reaches a resolver; that case is a
//! trivial merge.
//!
//! # Built-in strategies
//!
//! - **[`KeepBoth`]** (default): remote wins the original path, the local
//!   version forks to a deterministic conflict-suffixed path.
//! - **[`LastWriteWins`]**: newer mtime wins, hash tie-break, loser audited.

mod keep_both;
mod last_write_wins;
mod types;

pub use keep_both::KeepBoth;
pub use last_write_wins::LastWriteWins;
pub use types::{Conflict, Resolution, VersionInfo};

use crate::config::ConflictPolicy;

/// A conflict resolution strategy.
pub trait ConflictResolver: std::fmt::Debug + Send + Sync {
    /// Decide what happens to a divergent path.
    fn resolve(&self, conflict: &Conflict) -> Resolution;

    /// Policy name recorded in the conflict audit log.
    fn name(&self) -> &'static str;
}

/// The resolver for a configured policy.
pub fn resolver_for(policy: ConflictPolicy) -> Box<dyn ConflictResolver> {
    match policy {
        ConflictPolicy::KeepBoth => Box::new(KeepBoth::new()),
        ConflictPolicy::LastWriteWins => Box::new(LastWriteWins::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_for_policy() {
        assert_eq!(resolver_for(ConflictPolicy::KeepBoth).name(), "keep-both");
        assert_eq!(
            resolver_for(ConflictPolicy::LastWriteWins).name(),
            "last-write-wins"
        );
    }
}
