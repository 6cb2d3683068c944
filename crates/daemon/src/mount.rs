//! Mount lifecycle.
//!
//! `run_mount` wires together the metadata store, cache, bucket client and
//! sync engine, mounts the FUSE filesystem, and supervises everything until
//! a signal arrives. Teardown order matters: the engine drains before the
//! FUSE session is dropped so acknowledged writes get their upload attempt.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use common::conflict::resolver_for;
use common::{
    sync, CacheDir, CipherPipeline, EngineOptions, ExclusionFilter, MetadataStore, SyncConfig,
    SyncEngine,
};
use store::{BucketClient, BucketConfig, RetryPolicy};

use crate::config::CacheLayout;

/// Everything the mount and the one-shot `sync` command share.
pub struct Components {
    pub meta: MetadataStore,
    pub cache: Arc<CacheDir>,
    pub engine: Arc<SyncEngine>,
    pub handle: sync::SyncHandle,
    pub rx: flume::Receiver<sync::SyncRequest>,
    pub device_name: String,
    pub encrypted: bool,
    pub layout: CacheLayout,
}

/// Builds the sync stack from resolved configuration. Rolls interrupted
/// transfers back before anything else runs.
pub async fn build_components(
    bucket_config: &BucketConfig,
    sync_config: &SyncConfig,
) -> Result<Components> {
    let layout = CacheLayout::new(&sync_config.cache_dir);
    std::fs::create_dir_all(&layout.quarantine_dir)
        .with_context(|| format!("failed to create {}", layout.quarantine_dir.display()))?;

    let meta = MetadataStore::new(&layout.metadata_db).await?;
    meta.recover().await?;
    let device = meta.ensure_local_device(&sync_config.device_name).await?;

    let cache = Arc::new(CacheDir::new(&layout.files_dir)?);
    let cipher = Arc::new(CipherPipeline::new(&sync_config.encryption)?);
    let filter = ExclusionFilter::new(&sync_config.excluded_patterns)?;
    let bucket = Arc::new(BucketClient::new(bucket_config, RetryPolicy::default())?);
    let encrypted = cipher.is_enabled();

    let (handle, rx) = sync::channel();
    let engine = Arc::new(SyncEngine::new(
        meta.clone(),
        bucket,
        cipher,
        Arc::clone(&cache),
        filter,
        resolver_for(sync_config.conflict_policy),
        device.name.clone(),
        layout.quarantine_dir.clone(),
        EngineOptions::from_config(sync_config),
    ));

    Ok(Components {
        meta,
        cache,
        engine,
        handle,
        rx,
        device_name: device.name,
        encrypted,
        layout,
    })
}

/// Mounts the filesystem and blocks until SIGINT or SIGTERM.
#[cfg(feature = "fuse")]
pub async fn run_mount(bucket_config: &BucketConfig, sync_config: &SyncConfig) -> Result<()> {
    use fuser::MountOption;

    let mount_point = &sync_config.mount_point;
    std::fs::create_dir_all(mount_point)
        .with_context(|| format!("failed to create mount point {}", mount_point.display()))?;

    let components = build_components(bucket_config, sync_config).await?;
    write_pid_file(&components.layout.pid_file)?;

    let filter = ExclusionFilter::new(&sync_config.excluded_patterns)?;
    let fs = crate::fuse::ShareBoxFs::new(
        components.meta.clone(),
        Arc::clone(&components.cache),
        components.handle.clone(),
        filter,
        tokio::runtime::Handle::current(),
        components.device_name.clone(),
        sync_config.max_file_size,
        components.encrypted,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Arc::clone(&components.engine);
    let engine_task = tokio::spawn(engine.run(components.rx, shutdown_rx));

    let options = vec![
        MountOption::FSName("sharebox".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
        MountOption::NoAtime,
    ];
    let session = fuser::spawn_mount2(fs, mount_point, &options)
        .with_context(|| format!("failed to mount at {}", mount_point.display()))?;
    info!(mount_point = %mount_point.display(), device = components.device_name, "mounted");

    // Catch up with the bucket right away instead of waiting for the first
    // listing tick.
    components.handle.request_full_pass();

    wait_for_shutdown_signal().await;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!(error = %e, "sync engine task failed during shutdown");
    }
    drop(session);
    remove_pid_file(&components.layout.pid_file);
    info!("unmounted");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Ok(raw) = std::fs::read_to_string(path) {
        if let Ok(pid) = raw.trim().parse::<i32>() {
            if process_alive(pid) {
                bail!("another sharebox mount is running (pid {})", pid);
            }
        }
        warn!(pid_file = %path.display(), "removing stale pid file");
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(pid_file = %path.display(), error = %e, "failed to remove pid file");
        }
    }
}

#[cfg(feature = "fuse")]
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(feature = "fuse"))]
fn process_alive(_pid: i32) -> bool {
    false
}

/// Asks the kernel to unmount a running mount. The mounting process sees
/// the session end and shuts its engine down.
pub fn unmount(mount_point: &Path) -> Result<()> {
    let status = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .status()
        .context("failed to run fusermount")?;
    if !status.success() {
        bail!("fusermount -u {} failed", mount_point.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SyncConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_components_creates_layout() {
        let tmp = TempDir::new().unwrap();
        let sync_config = SyncConfig {
            cache_dir: tmp.path().join("cache"),
            mount_point: tmp.path().join("mnt"),
            device_name: "test-device".to_string(),
            ..SyncConfig::default()
        };
        let components = build_components(&BucketConfig::Memory, &sync_config)
            .await
            .unwrap();

        assert!(components.layout.quarantine_dir.exists());
        assert!(components.layout.files_dir.exists());
        assert!(components.layout.metadata_db.exists());
        assert_eq!(components.device_name, "test-device");
        assert!(!components.encrypted);
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("sharebox.pid");
        // No live process has pid 0 from our perspective; i32::MAX is not a
        // valid pid on Linux.
        std::fs::write(&pid_file, i32::MAX.to_string()).unwrap();
        write_pid_file(&pid_file).unwrap();
        let written: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(written, std::process::id());
    }
}
