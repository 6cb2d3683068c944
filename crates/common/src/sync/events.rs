//! Trigger channel between the filesystem handler and the engine.
//!
//! The handler runs on FUSE callback threads and must never block on the
//! engine, so triggers go through an unbounded flume channel and sends
//! never wait. Losing a trigger is harmless; the periodic dirty-entry scan
//! picks up anything a dropped trigger would have.

use tracing::debug;

/// A request for the engine to do work ahead of its next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Sync one logical path now.
    Path(String),
    /// Run a full scheduling pass now.
    FullPass,
}

/// Handler-side sender. Cheap to clone; one lives inside the filesystem
/// handler and one inside the mount supervisor.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: flume::Sender<SyncRequest>,
}

impl SyncHandle {
    pub fn request_path(&self, path: impl Into<String>) {
        let path = path.into();
        if self.tx.send(SyncRequest::Path(path.clone())).is_err() {
            debug!(path, "sync engine gone, dropping trigger");
        }
    }

    pub fn request_full_pass(&self) {
        if self.tx.send(SyncRequest::FullPass).is_err() {
            debug!("sync engine gone, dropping full-pass trigger");
        }
    }
}

/// Creates the trigger channel. The receiver goes to
/// [`SyncEngine::run`](crate::sync::SyncEngine::run).
pub fn channel() -> (SyncHandle, flume::Receiver<SyncRequest>) {
    let (tx, rx) = flume::unbounded();
    (SyncHandle { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggers_arrive_in_order() {
        let (handle, rx) = channel();
        handle.request_path("/a.txt");
        handle.request_full_pass();
        assert_eq!(rx.recv().unwrap(), SyncRequest::Path("/a.txt".to_string()));
        assert_eq!(rx.recv().unwrap(), SyncRequest::FullPass);
    }

    #[test]
    fn test_send_after_receiver_drop_does_not_panic() {
        let (handle, rx) = channel();
        drop(rx);
        handle.request_path("/a.txt");
        handle.request_full_pass();
    }
}
