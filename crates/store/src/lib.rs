//! Remote store client for ShareBox.
//!
//! Wraps an S3-compatible bucket (or a local/in-memory backend for tests)
//! behind a small get/put/delete/list surface with bounded retry, optimistic
//! version guards and multipart upload for large objects.

mod client;
mod config;
mod error;
mod retry;

pub use client::{BucketClient, ClientStats, RemoteObject, VersionGuard};
pub use config::BucketConfig;
pub use error::{Result, StoreError};
pub use retry::RetryPolicy;
