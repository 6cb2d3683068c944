//! The background sync engine.
//!
//! One engine runs per mount. It owns no file content and no entry state
//! outright; every transition goes through the metadata store's
//! compare-and-swap, so a path is worked on by at most one task at a time
//! even while the filesystem handler keeps mutating the cache underneath.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use store::{BucketClient, VersionGuard};

use crate::cache::CacheDir;
use crate::config::{ExclusionFilter, SyncConfig};
use crate::conflict::{Conflict, ConflictResolver, Resolution, VersionInfo};
use crate::crypto::{content_hash, CipherPipeline};
use crate::error::{Result, SyncError};
use crate::metadata::{ConflictAudit, FileEntry, MetadataStore, SyncState};
use crate::sync::events::SyncRequest;

/// Engine tuning knobs, resolved from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub sync_interval: Duration,
    pub list_interval: Duration,
    pub max_file_size: u64,
    pub workers: usize,
    pub max_attempts: u32,
    pub drain_timeout: Duration,
}

impl EngineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            sync_interval: Duration::from_secs(config.sync_interval_secs.max(1)),
            list_interval: Duration::from_secs(config.list_interval_secs.max(1)),
            max_file_size: config.max_file_size,
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
        }
    }
}

/// Moves content between the local cache and the bucket until both sides
/// agree.
pub struct SyncEngine {
    meta: MetadataStore,
    bucket: Arc<BucketClient>,
    cipher: Arc<CipherPipeline>,
    cache: Arc<CacheDir>,
    filter: ExclusionFilter,
    resolver: Arc<dyn ConflictResolver>,
    device: String,
    quarantine_dir: PathBuf,
    workers: Arc<Semaphore>,
    opts: EngineOptions,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device", &self.device)
            .field("policy", &self.resolver.name())
            .finish()
    }
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta: MetadataStore,
        bucket: Arc<BucketClient>,
        cipher: Arc<CipherPipeline>,
        cache: Arc<CacheDir>,
        filter: ExclusionFilter,
        resolver: Box<dyn ConflictResolver>,
        device: impl Into<String>,
        quarantine_dir: PathBuf,
        opts: EngineOptions,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(opts.workers));
        Self {
            meta,
            bucket,
            cipher,
            cache,
            filter,
            resolver: Arc::from(resolver),
            device: device.into(),
            quarantine_dir,
            workers,
            opts,
        }
    }

    /// Main loop. Runs until `shutdown` flips, then drains in-flight work
    /// for up to the drain timeout before aborting what remains.
    pub async fn run(
        self: Arc<Self>,
        rx: flume::Receiver<SyncRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sync_tick = tokio::time::interval(self.opts.sync_interval);
        let mut list_tick = tokio::time::interval(self.opts.list_interval);
        let mut tasks = JoinSet::new();

        info!(device = %self.device, policy = self.resolver.name(), "sync engine started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = list_tick.tick() => {
                    if let Err(e) = self.reconcile_remote().await {
                        warn!(error = %e, "remote reconciliation failed");
                    }
                    self.schedule_pending(&mut tasks).await;
                }
                _ = sync_tick.tick() => {
                    self.schedule_pending(&mut tasks).await;
                }
                request = rx.recv_async() => {
                    match request {
                        Ok(SyncRequest::Path(path)) => self.spawn_path(&mut tasks, path),
                        Ok(SyncRequest::FullPass) => {
                            if let Err(e) = self.reconcile_remote().await {
                                warn!(error = %e, "remote reconciliation failed");
                            }
                            self.schedule_pending(&mut tasks).await;
                        }
                        Err(_) => break,
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "sync task panicked");
                        }
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "sync engine draining");
        let drained = tokio::time::timeout(self.opts.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = tasks.len(),
                "drain timeout reached, abandoning in-flight sync work"
            );
            tasks.abort_all();
        }
        info!("sync engine stopped");
    }

    async fn schedule_pending(&self, tasks: &mut JoinSet<()>) {
        let pending = match self.meta.pending(self.opts.max_attempts).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to scan for pending entries");
                return;
            }
        };
        for entry in pending {
            self.spawn_path(tasks, entry.path);
        }
    }

    fn spawn_path(&self, tasks: &mut JoinSet<()>, path: String) {
        let engine = self.clone_handles();
        let workers = Arc::clone(&self.workers);
        tasks.spawn(async move {
            // Bounds concurrent transfers; CAS inside sync_path keeps a
            // doubly scheduled path from being worked twice.
            let Ok(_permit) = workers.acquire().await else {
                return;
            };
            if let Err(e) = engine.sync_path(&path).await {
                debug!(path, error = %e, "sync attempt failed");
            }
        });
    }

    // JoinSet tasks need an owned engine; all fields are cheaply shareable.
    fn clone_handles(&self) -> Arc<EngineCore> {
        Arc::new(EngineCore {
            meta: self.meta.clone(),
            bucket: Arc::clone(&self.bucket),
            cipher: Arc::clone(&self.cipher),
            cache: Arc::clone(&self.cache),
            filter: self.filter.clone(),
            resolver: Arc::clone(&self.resolver),
            device: self.device.clone(),
            quarantine_dir: self.quarantine_dir.clone(),
            max_file_size: self.opts.max_file_size,
        })
    }

    /// One full sequential pass: reconcile against the bucket, then work
    /// every pending entry until the set stabilizes. Used by the `sync` CLI
    /// command and by tests; the mounted engine uses [`run`] instead.
    ///
    /// [`run`]: SyncEngine::run
    pub async fn run_once(&self) -> Result<()> {
        let core = self.clone_handles();
        core.meta.recover().await?;
        core.reconcile_remote().await?;
        // Conflict forks and resurrected uploads create new pending work,
        // so loop until a pass finds nothing. Bounded; every iteration
        // either drains work or stops.
        for _ in 0..8 {
            let pending = core.meta.pending(self.opts.max_attempts).await?;
            if pending.is_empty() {
                break;
            }
            for entry in pending {
                if let Err(e) = core.sync_path(&entry.path).await {
                    debug!(path = entry.path, error = %e, "sync attempt failed");
                }
            }
        }
        Ok(())
    }

    pub async fn reconcile_remote(&self) -> Result<()> {
        self.clone_handles().reconcile_remote().await
    }
}

/// The share of the engine each worker task holds.
struct EngineCore {
    meta: MetadataStore,
    bucket: Arc<BucketClient>,
    cipher: Arc<CipherPipeline>,
    cache: Arc<CacheDir>,
    filter: ExclusionFilter,
    resolver: Arc<dyn ConflictResolver>,
    device: String,
    quarantine_dir: PathBuf,
    max_file_size: u64,
}

impl EngineCore {
    /// Dispatches one path according to its current state. Every branch
    /// starts with a compare-and-swap, so concurrent schedules of the same
    /// path collapse to one worker.
    async fn sync_path(&self, path: &str) -> Result<()> {
        let Some(entry) = self.meta.get(path).await? else {
            return Ok(());
        };
        if entry.is_dir {
            return Ok(());
        }
        match entry.sync_state {
            SyncState::LocallyModified => self.upload(entry).await,
            SyncState::RemotelyModified => self.download(entry).await,
            SyncState::Deleted => self.delete_remote(entry).await,
            SyncState::Conflicted => self.handle_conflicted(entry).await,
            _ => Ok(()),
        }
    }

    async fn upload(&self, entry: FileEntry) -> Result<()> {
        let path = entry.path.clone();
        if self.filter.is_excluded(&path) {
            // Excluded paths live local-only; drop any stray entry.
            self.meta.remove(&path).await?;
            return Ok(());
        }

        if !self
            .meta
            .compare_and_swap(&path, SyncState::LocallyModified, SyncState::Uploading)
            .await?
        {
            return Ok(());
        }

        let read = {
            let _guard = self.cache.lock(&path);
            self.cache.read(&path)
        };
        let content = match read {
            Ok(content) => content,
            Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                // Content vanished under us; treat as a local delete.
                self.meta
                    .compare_and_swap(&path, SyncState::Uploading, SyncState::Deleted)
                    .await?;
                return Ok(());
            }
            Err(e) => {
                self.fail_upload(&path, &e.to_string()).await?;
                return Err(e);
            }
        };

        if content.len() as u64 > self.max_file_size {
            let e = SyncError::SizeLimit {
                size: content.len() as u64,
                limit: self.max_file_size,
            };
            self.fail_upload(&path, &e.to_string()).await?;
            return Err(e);
        }

        let hash = content_hash(&content);
        let payload = self.cipher.encrypt(&content)?;
        let guard = if entry.remote_version.is_empty() {
            VersionGuard::Absent
        } else {
            VersionGuard::Matches(entry.remote_version.clone())
        };

        match self.bucket.put(&path, Bytes::from(payload), guard).await {
            Ok(version) => {
                if self.meta.finish_upload(&path, &version, &hash).await? {
                    info!(path, version, "uploaded");
                } else {
                    // Re-dirtied mid-upload; the next pass uploads again,
                    // conditionally against the version just written.
                    debug!(path, "entry changed during upload, will re-sync");
                    self.meta.set_remote_version(&path, &version).await?;
                }
                Ok(())
            }
            Err(e) if e.is_version_mismatch() => {
                // Someone else wrote the object since we last saw it.
                warn!(path, "upload rejected by version precondition, resolving conflict");
                self.meta
                    .compare_and_swap(&path, SyncState::Uploading, SyncState::Conflicted)
                    .await?;
                let Some(entry) = self.meta.get(&path).await? else {
                    return Ok(());
                };
                self.handle_conflicted(entry).await
            }
            Err(e) => {
                self.fail_upload(&path, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    async fn fail_upload(&self, path: &str, message: &str) -> Result<()> {
        self.meta
            .compare_and_swap(path, SyncState::Uploading, SyncState::LocallyModified)
            .await?;
        self.meta.mark_error(path, message).await
    }

    async fn download(&self, entry: FileEntry) -> Result<()> {
        let path = entry.path.clone();
        if !self
            .meta
            .compare_and_swap(&path, SyncState::RemotelyModified, SyncState::Downloading)
            .await?
        {
            return Ok(());
        }

        let (payload, remote) = match self.bucket.get(&path).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_not_found() => {
                // Deleted remotely before we fetched it; nothing to keep.
                debug!(path, "remote object gone before download, purging entry");
                self.purge(&path).await?;
                return Ok(());
            }
            Err(e) => {
                self.meta
                    .compare_and_swap(&path, SyncState::Downloading, SyncState::RemotelyModified)
                    .await?;
                self.meta.mark_error(&path, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let plaintext = match self.cipher.decrypt(&payload) {
            Ok(plaintext) => plaintext,
            Err(e @ SyncError::Integrity(_)) => {
                // Both versions are retained: the remote payload in
                // quarantine, the local cache untouched.
                error!(path, error = %e, "download failed integrity check, quarantining");
                self.quarantine(&path, &payload)?;
                self.meta
                    .compare_and_swap(&path, SyncState::Downloading, SyncState::Conflicted)
                    .await?;
                self.meta.mark_error(&path, &e.to_string()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let hash = content_hash(&plaintext);
        {
            let _guard = self.cache.lock(&path);
            self.cache.write_atomic(&path, &plaintext)?;
        }
        let size = plaintext.len() as u64;
        if self
            .meta
            .finish_download(&path, &remote.version, &hash, size, remote.mtime.timestamp())
            .await?
        {
            info!(path, version = remote.version, "downloaded");
        } else {
            debug!(path, "entry changed during download");
        }
        Ok(())
    }

    async fn delete_remote(&self, entry: FileEntry) -> Result<()> {
        let path = entry.path.clone();
        if entry.remote_version.is_empty() {
            // Never uploaded; the delete is purely local.
            self.purge(&path).await?;
            return Ok(());
        }

        if !self
            .meta
            .compare_and_swap(&path, SyncState::Deleted, SyncState::Tombstoned)
            .await?
        {
            return Ok(());
        }

        match self.bucket.delete(&path).await {
            Ok(()) => {
                info!(path, "deleted remote object");
                self.purge(&path).await
            }
            Err(e) => {
                self.meta
                    .compare_and_swap(&path, SyncState::Tombstoned, SyncState::Deleted)
                    .await?;
                self.meta.mark_error(&path, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    /// Full listing reconciliation: discover foreign creations and edits,
    /// detect divergences, and apply remote deletions.
    async fn reconcile_remote(&self) -> Result<()> {
        let remote = self.bucket.list(None).await?;
        let entries = self.meta.list("/").await?;
        debug!(
            remote = remote.len(),
            local = entries.len(),
            "reconciling against bucket listing"
        );

        let mut remote_by_path = std::collections::HashMap::new();
        for obj in &remote {
            remote_by_path.insert(format!("/{}", obj.key), obj);
        }

        for obj in &remote {
            let path = format!("/{}", obj.key);
            if self.filter.is_excluded(&path) {
                continue;
            }
            match self.meta.get(&path).await? {
                None => {
                    debug!(path, "discovered new remote object");
                    self.meta
                        .upsert(&FileEntry::remote_discovery(
                            &path,
                            &obj.version,
                            obj.size,
                            obj.mtime.timestamp(),
                            self.cipher.is_enabled(),
                        ))
                        .await?;
                }
                Some(entry) if entry.remote_version == obj.version => {}
                Some(entry) => match entry.sync_state {
                    SyncState::Clean => {
                        self.meta
                            .compare_and_swap(&path, SyncState::Clean, SyncState::RemotelyModified)
                            .await?;
                    }
                    SyncState::LocallyModified => {
                        // Both sides moved since the last common version.
                        self.meta
                            .compare_and_swap(
                                &path,
                                SyncState::LocallyModified,
                                SyncState::Conflicted,
                            )
                            .await?;
                    }
                    SyncState::Deleted => {
                        // A foreign edit outranks our pending delete.
                        info!(path, "remote edit supersedes local delete");
                        self.meta
                            .upsert(&FileEntry::remote_discovery(
                                &path,
                                &obj.version,
                                obj.size,
                                obj.mtime.timestamp(),
                                self.cipher.is_enabled(),
                            ))
                            .await?;
                    }
                    _ => {}
                },
            }
        }

        // Entries that reference a remote version which no longer exists
        // were deleted by another device.
        for entry in entries {
            if entry.is_dir
                || entry.remote_version.is_empty()
                || remote_by_path.contains_key(&entry.path)
                || self.filter.is_excluded(&entry.path)
            {
                continue;
            }
            match entry.sync_state {
                SyncState::Clean | SyncState::RemotelyModified => {
                    info!(path = entry.path, "applying remote deletion");
                    self.purge(&entry.path).await?;
                }
                SyncState::LocallyModified => {
                    // Local edits survive a foreign delete; forget the
                    // stale version so the next upload re-creates the
                    // object.
                    info!(path = entry.path, "remote deleted under local edit, will re-create");
                    self.meta.clear_remote_version(&entry.path).await?;
                }
                SyncState::Deleted | SyncState::Tombstoned => {
                    // Both sides deleted; nothing left to propagate.
                    self.purge(&entry.path).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolves a detected divergence.
    ///
    /// Identical content on both sides is a trivial merge. Otherwise the
    /// configured policy decides, and the losing version's hash lands in
    /// the audit log before anything is replaced.
    ///
    /// Resolution owns the path through the same compare-and-swap as a
    /// transfer, so doubly scheduled conflicts collapse to one worker. The
    /// in-flight marker is `Uploading`: a resolution that dies mid-way
    /// recovers as locally-modified, and the conditional re-upload runs
    /// into the version mismatch again and re-detects the divergence.
    async fn handle_conflicted(&self, entry: FileEntry) -> Result<()> {
        let path = entry.path.clone();

        if !self
            .meta
            .compare_and_swap(&path, SyncState::Conflicted, SyncState::Uploading)
            .await?
        {
            return Ok(());
        }

        let (payload, remote) = match self.bucket.get(&path).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_not_found() => {
                // The remote side of the conflict is gone; local wins by
                // default.
                self.meta.clear_remote_version(&path).await?;
                return Ok(());
            }
            Err(e) => {
                self.meta
                    .compare_and_swap(&path, SyncState::Uploading, SyncState::Conflicted)
                    .await?;
                self.meta.mark_error(&path, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let plaintext = match self.cipher.decrypt(&payload) {
            Ok(plaintext) => plaintext,
            Err(e @ SyncError::Integrity(_)) => {
                error!(path, error = %e, "conflicting remote version failed integrity check");
                self.quarantine(&path, &payload)?;
                self.meta
                    .compare_and_swap(&path, SyncState::Uploading, SyncState::Conflicted)
                    .await?;
                self.meta.mark_error(&path, &e.to_string()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let remote_hash = content_hash(&plaintext);
        if remote_hash == entry.local_hash {
            debug!(path, "divergent versions hold identical content, merging");
            self.meta.merge_clean(&path, &remote.version).await?;
            return Ok(());
        }

        let conflict = Conflict {
            path: path.clone(),
            local: VersionInfo {
                hash: entry.local_hash.clone(),
                mtime: entry.mtime,
            },
            remote: VersionInfo {
                hash: remote_hash.clone(),
                mtime: remote.mtime.timestamp(),
            },
            device: self.device.clone(),
        };

        match self.resolver.resolve(&conflict) {
            Resolution::KeepLocal => {
                info!(path, policy = self.resolver.name(), "conflict resolved: local wins");
                self.audit(&path, "local", &remote_hash).await?;
                self.meta.adopt_remote_version(&path, &remote.version).await?;
            }
            Resolution::KeepRemote => {
                info!(path, policy = self.resolver.name(), "conflict resolved: remote wins");
                self.audit(&path, "remote", &entry.local_hash).await?;
                {
                    let _guard = self.cache.lock(&path);
                    self.cache.write_atomic(&path, &plaintext)?;
                }
                let mut merged = entry;
                merged.local_hash = remote_hash;
                merged.remote_version = remote.version;
                merged.size = plaintext.len() as u64;
                merged.mtime = remote.mtime.timestamp();
                merged.sync_state = SyncState::Clean;
                merged.attempts = 0;
                merged.last_error = None;
                self.meta.upsert(&merged).await?;
            }
            Resolution::ForkLocal { fork_path } => {
                info!(path, fork = fork_path, policy = self.resolver.name(), "conflict resolved: keeping both");
                self.audit(&path, "remote", &entry.local_hash).await?;
                {
                    let _guard = self.cache.lock(&path);
                    if self.cache.exists(&path)? {
                        self.cache.rename(&path, &fork_path)?;
                    }
                    self.cache.write_atomic(&path, &plaintext)?;
                }
                // The fork syncs as a brand new file.
                self.meta
                    .upsert(&FileEntry::local_create(
                        &fork_path,
                        &entry.local_hash,
                        entry.size,
                        entry.mtime,
                        &self.device,
                        entry.encrypted,
                    ))
                    .await?;
                let mut original = entry;
                original.local_hash = remote_hash;
                original.remote_version = remote.version;
                original.size = plaintext.len() as u64;
                original.mtime = remote.mtime.timestamp();
                original.sync_state = SyncState::Clean;
                original.attempts = 0;
                original.last_error = None;
                self.meta.upsert(&original).await?;
            }
        }
        Ok(())
    }

    async fn audit(&self, path: &str, winner: &str, loser_hash: &str) -> Result<()> {
        self.meta
            .record_conflict(&ConflictAudit {
                path: path.to_string(),
                winner: winner.to_string(),
                loser_hash: loser_hash.to_string(),
                policy: self.resolver.name().to_string(),
                resolved_at: Utc::now().timestamp(),
            })
            .await
    }

    /// Drops every trace of a path on this device.
    async fn purge(&self, path: &str) -> Result<()> {
        self.meta.remove(path).await?;
        self.cache.remove(path)?;
        Ok(())
    }

    /// Preserves a payload that failed its integrity check. The tree shape
    /// under the quarantine directory mirrors the logical namespace.
    fn quarantine(&self, path: &str, payload: &[u8]) -> Result<()> {
        let relative = path.trim_start_matches('/');
        let dest = self.quarantine_dir.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, payload)?;
        warn!(path, quarantined = %dest.display(), "payload quarantined");
        Ok(())
    }
}
