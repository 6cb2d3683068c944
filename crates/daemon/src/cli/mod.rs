//! Command-line interface.
//!
//! Exit codes are stable so scripts can branch on them: 2 for mount
//! failures, 3 for sync failures, 4 for unmount failures, 1 for anything
//! else.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use crate::config::{AppConfig, CacheLayout};
use crate::mount;
use crate::status::StatusReport;

pub const EXIT_MOUNT_FAILED: u8 = 2;
pub const EXIT_SYNC_FAILED: u8 = 3;
pub const EXIT_UNMOUNT_FAILED: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "sharebox", version, about = "Synchronizing cache filesystem for S3-compatible buckets")]
pub struct Cli {
    /// Path to the config file.
    #[arg(long, short, global = true, env = "SHAREBOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount the filesystem and run the sync engine until interrupted.
    #[cfg(feature = "fuse")]
    Mount {
        /// Mount point, overriding the configured one.
        #[arg(long)]
        mount_point: Option<PathBuf>,
        /// Force client-side encryption on, even if the config leaves it
        /// off. The password comes from the config file or
        /// SHAREBOX_PASSWORD.
        #[arg(long)]
        encrypt: bool,
    },
    /// Unmount a running mount.
    Unmount {
        /// Mount point, overriding the configured one.
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },
    /// Run one synchronization pass and exit. Always performs one bucket
    /// listing to pick up changes made by other devices, even when nothing
    /// changed locally.
    Sync,
    /// Show per-state file counts, failing paths and resolved conflicts.
    Status {
        /// Emit machine-readable JSON instead of tables.
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> ExitCode {
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(AppConfig::default_path);
        let config = match AppConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("{:#}", e);
                return ExitCode::FAILURE;
            }
        };

        match self.command {
            #[cfg(feature = "fuse")]
            Command::Mount {
                mount_point,
                encrypt,
            } => {
                match run_mount(&config, mount_point.as_deref(), encrypt).await {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        error!("mount failed: {:#}", e);
                        ExitCode::from(EXIT_MOUNT_FAILED)
                    }
                }
            }
            Command::Unmount { mount_point } => {
                match run_unmount(&config, mount_point.as_deref()) {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        error!("unmount failed: {:#}", e);
                        ExitCode::from(EXIT_UNMOUNT_FAILED)
                    }
                }
            }
            Command::Sync => match run_sync(&config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("sync failed: {:#}", e);
                    ExitCode::from(EXIT_SYNC_FAILED)
                }
            },
            Command::Status { json } => match run_status(&config, json).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("status failed: {:#}", e);
                    ExitCode::FAILURE
                }
            },
        }
    }
}

#[cfg(feature = "fuse")]
async fn run_mount(
    config: &AppConfig,
    mount_point: Option<&std::path::Path>,
    encrypt: bool,
) -> Result<()> {
    let (bucket, mut sync) = config.resolve(mount_point)?;
    if encrypt {
        sync.encryption.enabled = true;
    }
    if sync.encryption.enabled && sync.encryption.password.is_empty() {
        if let Ok(password) = std::env::var("SHAREBOX_PASSWORD") {
            sync.encryption.password = password;
        }
    }
    mount::run_mount(&bucket, &sync).await
}

fn run_unmount(config: &AppConfig, mount_point: Option<&std::path::Path>) -> Result<()> {
    let (_, sync) = config.resolve(mount_point)?;
    mount::unmount(&sync.mount_point)
}

async fn run_sync(config: &AppConfig) -> Result<()> {
    // The one-shot pass needs no mount point; fall back to a placeholder
    // when none is configured.
    let (bucket, sync) = config.resolve(Some(std::path::Path::new("/")))?;
    let components = mount::build_components(&bucket, &sync).await?;
    components.engine.run_once().await?;
    let counts = components.meta.counts().await?;
    println!(
        "synced: {} clean, {} pending, {} conflicted",
        counts.clean,
        counts.pending(),
        counts.conflicted
    );
    Ok(())
}

async fn run_status(config: &AppConfig, json: bool) -> Result<()> {
    let (_, sync) = config.resolve(Some(std::path::Path::new("/")))?;
    let layout = CacheLayout::new(&sync.cache_dir);
    let meta = common::MetadataStore::new(&layout.metadata_db).await?;
    let report = StatusReport::collect(&meta, sync.max_attempts).await?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}
