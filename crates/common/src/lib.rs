//! Core of the ShareBox synchronizing cache filesystem.
//!
//! The filesystem handler (in the daemon crate) and the background
//! [`sync::SyncEngine`] share no memory directly; everything they both
//! touch goes through the [`metadata::MetadataStore`] and its
//! compare-and-swap primitive, plus per-path advisory locks on the
//! [`cache::CacheDir`].

pub mod cache;
pub mod config;
pub mod conflict;
pub mod crypto;
pub mod error;
pub mod metadata;
pub mod sync;

pub use cache::CacheDir;
pub use config::{ConflictPolicy, EncryptionConfig, ExclusionFilter, SyncConfig};
pub use crypto::CipherPipeline;
pub use error::{Result, SyncError};
pub use metadata::{DeviceRecord, FileEntry, MetadataStore, StateCounts, SyncState};
pub use sync::{EngineOptions, SyncEngine, SyncHandle, SyncRequest};
