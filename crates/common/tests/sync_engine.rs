//! Multi-device sync scenarios against a shared in-memory bucket.
//!
//! Each simulated device gets its own cache directory and metadata store;
//! all of them share one bucket backend, exactly as real mounts share an
//! S3 bucket. Filesystem writes are simulated by updating the cache and
//! metadata the way the mount handler does.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use object_store::memory::InMemory;
use tempfile::TempDir;

use common::conflict::resolver_for;
use common::crypto::content_hash;
use common::metadata::SyncState;
use common::{
    CacheDir, CipherPipeline, ConflictPolicy, EncryptionConfig, EngineOptions, ExclusionFilter,
    FileEntry, MetadataStore, SyncEngine,
};
use store::{BucketClient, RetryPolicy};

struct DeviceSpec {
    name: &'static str,
    policy: ConflictPolicy,
    password: Option<&'static str>,
    excluded: Vec<String>,
    max_file_size: u64,
}

impl DeviceSpec {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            policy: ConflictPolicy::KeepBoth,
            password: None,
            excluded: Vec::new(),
            max_file_size: 1024 * 1024,
        }
    }

    fn policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn password(mut self, password: &'static str) -> Self {
        self.password = Some(password);
        self
    }

    fn excluded(mut self, patterns: &[&str]) -> Self {
        self.excluded = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    fn max_file_size(mut self, limit: u64) -> Self {
        self.max_file_size = limit;
        self
    }
}

struct Device {
    _tmp: TempDir,
    name: String,
    meta: MetadataStore,
    cache: Arc<CacheDir>,
    quarantine: PathBuf,
    engine: SyncEngine,
}

impl Device {
    async fn start(spec: DeviceSpec, bucket: Arc<BucketClient>) -> Self {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(CacheDir::new(tmp.path().join("files")).unwrap());
        let quarantine = tmp.path().join("state").join("quarantine");
        let meta = MetadataStore::in_memory().await.unwrap();
        let cipher = match spec.password {
            Some(password) => Arc::new(
                CipherPipeline::new(&EncryptionConfig {
                    enabled: true,
                    password: password.to_string(),
                    algorithm: "aes-256-gcm".to_string(),
                })
                .unwrap(),
            ),
            None => Arc::new(CipherPipeline::disabled()),
        };
        let opts = EngineOptions {
            sync_interval: Duration::from_millis(50),
            list_interval: Duration::from_millis(50),
            max_file_size: spec.max_file_size,
            workers: 2,
            max_attempts: 5,
            drain_timeout: Duration::from_secs(5),
        };
        let engine = SyncEngine::new(
            meta.clone(),
            bucket,
            cipher,
            Arc::clone(&cache),
            ExclusionFilter::new(&spec.excluded).unwrap(),
            resolver_for(spec.policy),
            spec.name,
            quarantine.clone(),
            opts,
        );
        Self {
            _tmp: tmp,
            name: spec.name.to_string(),
            meta,
            cache,
            quarantine,
            engine,
        }
    }

    /// Simulates a file created or overwritten through the mount: content
    /// lands in the cache and the entry turns locally-modified, keeping any
    /// remote version it already tracked.
    async fn write(&self, path: &str, content: &[u8], mtime: i64) {
        self.cache.write_atomic(path, content).unwrap();
        let hash = content_hash(content);
        let entry = match self.meta.get(path).await.unwrap() {
            Some(mut existing) => {
                existing.local_hash = hash;
                existing.size = content.len() as u64;
                existing.mtime = mtime;
                existing.sync_state = SyncState::LocallyModified;
                existing.device_origin = self.name.clone();
                existing
            }
            None => FileEntry::local_create(
                path,
                hash,
                content.len() as u64,
                mtime,
                &self.name,
                false,
            ),
        };
        self.meta.upsert(&entry).await.unwrap();
    }

    /// Simulates an unlink through the mount.
    async fn delete(&self, path: &str) {
        self.cache.remove(path).unwrap();
        let mut entry = self.meta.get(path).await.unwrap().unwrap();
        entry.sync_state = SyncState::Deleted;
        self.meta.upsert(&entry).await.unwrap();
    }

    async fn sync(&self) {
        self.engine.run_once().await.unwrap();
    }

    async fn state(&self, path: &str) -> Option<SyncState> {
        self.meta.get(path).await.unwrap().map(|e| e.sync_state)
    }

    fn content(&self, path: &str) -> Vec<u8> {
        self.cache.read(path).unwrap()
    }
}

fn shared_bucket() -> Arc<BucketClient> {
    Arc::new(BucketClient::with_backend(
        Arc::new(InMemory::new()),
        RetryPolicy::default(),
    ))
}

#[tokio::test]
async fn test_two_devices_converge() {
    let bucket = shared_bucket();
    let a = Device::start(DeviceSpec::new("alpha"), Arc::clone(&bucket)).await;
    let b = Device::start(DeviceSpec::new("beta"), Arc::clone(&bucket)).await;

    a.write("/notes.txt", b"remember the milk", 1000).await;
    a.write("/docs/report.md", b"# Q3", 1001).await;
    a.sync().await;
    b.sync().await;

    assert_eq!(b.content("/notes.txt"), b"remember the milk");
    assert_eq!(b.content("/docs/report.md"), b"# Q3");
    assert_eq!(a.state("/notes.txt").await, Some(SyncState::Clean));
    assert_eq!(b.state("/notes.txt").await, Some(SyncState::Clean));

    let a_entry = a.meta.get("/notes.txt").await.unwrap().unwrap();
    let b_entry = b.meta.get("/notes.txt").await.unwrap().unwrap();
    assert_eq!(a_entry.local_hash, b_entry.local_hash);
    assert_eq!(a_entry.remote_version, b_entry.remote_version);
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let bucket = shared_bucket();
    let a = Device::start(DeviceSpec::new("alpha"), Arc::clone(&bucket)).await;

    a.write("/a.txt", b"stable", 1000).await;
    a.sync().await;
    a.sync().await;

    let before = bucket.stats().operations;
    a.sync().await;
    // A no-op pass costs exactly the one listing used to reconcile.
    assert_eq!(bucket.stats().operations - before, 1);
}

#[tokio::test]
async fn test_excluded_paths_stay_local() {
    let bucket = shared_bucket();
    let a = Device::start(
        DeviceSpec::new("alpha").excluded(&["*.tmp"]),
        Arc::clone(&bucket),
    )
    .await;

    a.write("/scratch.tmp", b"throwaway", 1000).await;
    a.write("/keep.txt", b"keep", 1001).await;
    a.sync().await;

    let keys: Vec<String> = bucket
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.key)
        .collect();
    assert_eq!(keys, vec!["keep.txt".to_string()]);
    // The excluded file stays usable locally.
    assert_eq!(a.content("/scratch.tmp"), b"throwaway");
    assert!(a.meta.get("/scratch.tmp").await.unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_file_is_rejected_not_uploaded() {
    let bucket = shared_bucket();
    let a = Device::start(
        DeviceSpec::new("alpha").max_file_size(16),
        Arc::clone(&bucket),
    )
    .await;

    a.write("/big.bin", &[0u8; 64], 1000).await;
    a.sync().await;

    assert!(bucket.list(None).await.unwrap().is_empty());
    let entry = a.meta.get("/big.bin").await.unwrap().unwrap();
    assert_eq!(entry.sync_state, SyncState::LocallyModified);
    assert!(entry.attempts >= 5);
    assert!(entry.last_error.unwrap().contains("exceeds"));
}

#[tokio::test]
async fn test_delete_propagates() {
    let bucket = shared_bucket();
    let a = Device::start(DeviceSpec::new("alpha"), Arc::clone(&bucket)).await;
    let b = Device::start(DeviceSpec::new("beta"), Arc::clone(&bucket)).await;

    a.write("/gone.txt", b"short-lived", 1000).await;
    a.sync().await;
    b.sync().await;
    assert_eq!(b.content("/gone.txt"), b"short-lived");

    b.delete("/gone.txt").await;
    b.sync().await;
    assert!(bucket.list(None).await.unwrap().is_empty());
    assert_eq!(b.state("/gone.txt").await, None);

    a.sync().await;
    assert_eq!(a.state("/gone.txt").await, None);
    assert!(!a.cache.exists("/gone.txt").unwrap());
}

#[tokio::test]
async fn test_local_edit_survives_remote_delete() {
    let bucket = shared_bucket();
    let a = Device::start(DeviceSpec::new("alpha"), Arc::clone(&bucket)).await;
    let b = Device::start(DeviceSpec::new("beta"), Arc::clone(&bucket)).await;

    a.write("/doc.txt", b"v1", 1000).await;
    a.sync().await;
    b.sync().await;

    b.delete("/doc.txt").await;
    b.sync().await;

    // The edit on the other device outranks the delete; the file comes
    // back under a fresh remote version.
    a.write("/doc.txt", b"v2 survives", 2000).await;
    a.sync().await;

    let objects = bucket.list(None).await.unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(a.state("/doc.txt").await, Some(SyncState::Clean));

    b.sync().await;
    assert_eq!(b.content("/doc.txt"), b"v2 survives");
}

#[tokio::test]
async fn test_keep_both_forks_deterministically() {
    let bucket = shared_bucket();
    let a = Device::start(DeviceSpec::new("alpha"), Arc::clone(&bucket)).await;
    let b = Device::start(DeviceSpec::new("beta"), Arc::clone(&bucket)).await;

    a.write("/doc.txt", b"base", 1000).await;
    a.sync().await;
    b.sync().await;

    a.write("/doc.txt", b"from alpha", 2000).await;
    b.write("/doc.txt", b"from beta", 2001).await;
    a.sync().await;
    b.sync().await;

    // Remote content wins the original path; the local edit forks to a
    // name derived from the device and mtime.
    assert_eq!(b.content("/doc.txt"), b"from alpha");
    assert_eq!(b.content("/doc@beta-2001.txt"), b"from beta");
    assert_eq!(b.state("/doc.txt").await, Some(SyncState::Clean));
    assert_eq!(b.state("/doc@beta-2001.txt").await, Some(SyncState::Clean));

    // The fork was uploaded, so the first device converges to both files.
    a.sync().await;
    assert_eq!(a.content("/doc.txt"), b"from alpha");
    assert_eq!(a.content("/doc@beta-2001.txt"), b"from beta");
    assert_eq!(bucket.list(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_racing_passes_resolve_a_conflict_once() {
    let bucket = shared_bucket();
    let a = Device::start(DeviceSpec::new("alpha"), Arc::clone(&bucket)).await;
    let b = Device::start(DeviceSpec::new("beta"), Arc::clone(&bucket)).await;

    a.write("/doc.txt", b"base", 1000).await;
    a.sync().await;
    b.sync().await;

    a.write("/doc.txt", b"from alpha", 2000).await;
    b.write("/doc.txt", b"from beta", 2001).await;
    a.sync().await;

    // Two passes race over the same divergence; the ownership CAS lets
    // only one of them run the resolution, so the fork is created exactly
    // once and never clobbered by a second restore of the remote copy.
    let (first, second) = tokio::join!(b.engine.run_once(), b.engine.run_once());
    first.unwrap();
    second.unwrap();

    let audits = b.meta.conflicts().await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(b.content("/doc.txt"), b"from alpha");
    assert_eq!(b.content("/doc@beta-2001.txt"), b"from beta");
    assert_eq!(b.state("/doc.txt").await, Some(SyncState::Clean));
}

#[tokio::test]
async fn test_last_write_wins_audits_the_loser() {
    let bucket = shared_bucket();
    let a = Device::start(
        DeviceSpec::new("alpha").policy(ConflictPolicy::LastWriteWins),
        Arc::clone(&bucket),
    )
    .await;
    let b = Device::start(
        DeviceSpec::new("beta").policy(ConflictPolicy::LastWriteWins),
        Arc::clone(&bucket),
    )
    .await;

    a.write("/doc.txt", b"base", 1000).await;
    a.sync().await;
    b.sync().await;

    // The remote side of a conflict carries the bucket's upload timestamp,
    // so the winning local edit has to be newer than the wall clock.
    let future = chrono::Utc::now().timestamp() + 3600;
    a.write("/doc.txt", b"older edit", 2000).await;
    b.write("/doc.txt", b"newer edit", future).await;
    a.sync().await;
    b.sync().await;

    assert_eq!(b.content("/doc.txt"), b"newer edit");
    a.sync().await;
    assert_eq!(a.content("/doc.txt"), b"newer edit");
    assert_eq!(bucket.list(None).await.unwrap().len(), 1);

    let audits = b.meta.conflicts().await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].path, "/doc.txt");
    assert_eq!(audits[0].winner, "local");
    assert_eq!(audits[0].policy, "last-write-wins");
    assert_eq!(audits[0].loser_hash, content_hash(b"older edit"));
}

#[tokio::test]
async fn test_encrypted_sync_end_to_end() {
    let bucket = shared_bucket();
    let a = Device::start(
        DeviceSpec::new("alpha").password("shared secret"),
        Arc::clone(&bucket),
    )
    .await;
    let b = Device::start(
        DeviceSpec::new("beta").password("shared secret"),
        Arc::clone(&bucket),
    )
    .await;

    a.write("/secret.txt", b"the plans", 1000).await;
    a.sync().await;

    // The bucket only ever sees ciphertext.
    let (payload, _) = bucket.get("/secret.txt").await.unwrap();
    assert_ne!(payload.as_ref(), b"the plans");
    assert!(payload.len() > b"the plans".len());

    b.sync().await;
    assert_eq!(b.content("/secret.txt"), b"the plans");
}

#[tokio::test]
async fn test_wrong_password_quarantines_instead_of_serving_garbage() {
    let bucket = shared_bucket();
    let a = Device::start(
        DeviceSpec::new("alpha").password("right"),
        Arc::clone(&bucket),
    )
    .await;
    let c = Device::start(
        DeviceSpec::new("gamma").password("wrong"),
        Arc::clone(&bucket),
    )
    .await;

    a.write("/secret.txt", b"the plans", 1000).await;
    a.sync().await;
    c.sync().await;

    assert!(!c.cache.exists("/secret.txt").unwrap());
    assert!(c.quarantine.join("secret.txt").exists());
    let entry = c.meta.get("/secret.txt").await.unwrap().unwrap();
    assert_eq!(entry.sync_state, SyncState::Conflicted);
    assert!(entry.attempts >= 1);
    assert!(entry.last_error.unwrap().contains("integrity"));
}

#[tokio::test]
async fn test_identical_concurrent_edits_merge_trivially() {
    let bucket = shared_bucket();
    let a = Device::start(DeviceSpec::new("alpha"), Arc::clone(&bucket)).await;
    let b = Device::start(DeviceSpec::new("beta"), Arc::clone(&bucket)).await;

    a.write("/doc.txt", b"base", 1000).await;
    a.sync().await;
    b.sync().await;

    a.write("/doc.txt", b"same bytes", 2000).await;
    b.write("/doc.txt", b"same bytes", 2001).await;
    a.sync().await;
    b.sync().await;

    // No fork, no audit entry; both sides settle on the single object.
    assert_eq!(bucket.list(None).await.unwrap().len(), 1);
    assert_eq!(b.state("/doc.txt").await, Some(SyncState::Clean));
    assert!(b.meta.conflicts().await.unwrap().is_empty());
}
