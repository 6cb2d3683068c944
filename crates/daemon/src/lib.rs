//! ShareBox mount daemon.
//!
//! Wires the sync core (metadata store, cache, engine) to a FUSE mount and
//! exposes the `sharebox` CLI.

pub mod cli;
pub mod config;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod logging;
pub mod mount;
pub mod status;

pub use config::{AppConfig, CacheLayout};
pub use status::StatusReport;
