//! Thin, retrying client over an object-storage bucket.
//!
//! All operations go through [`RetryPolicy`]; version guards map onto the
//! backend's conditional-put support so concurrent writers from different
//! devices are detected as [`StoreError::VersionMismatch`] instead of
//! silently overwriting each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{
    ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion, WriteMultipart,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::BucketConfig;
use crate::error::{classify, Result, StoreError};
use crate::retry::RetryPolicy;

/// Objects at or above this size are uploaded via multipart transfer.
const MULTIPART_THRESHOLD: usize = 16 * 1024 * 1024;

/// Part size for multipart uploads.
const MULTIPART_CHUNK: usize = 8 * 1024 * 1024;

/// One object as observed in the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Object key, no leading slash.
    pub key: String,
    /// Opaque version token (ETag when the backend provides one).
    pub version: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

impl RemoteObject {
    fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            key: meta.location.to_string(),
            version: version_of(meta),
            size: meta.size as u64,
            mtime: meta.last_modified,
        }
    }
}

/// Precondition attached to a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionGuard {
    /// Unconditional overwrite.
    Any,
    /// Only succeed if the key does not exist yet. Used for first uploads so
    /// a concurrent create on another device surfaces as a version mismatch.
    Absent,
    /// Only succeed if the remote version still matches.
    Matches(String),
}

/// Cumulative backend call counters, exposed for `status` and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientStats {
    pub operations: u64,
}

/// Retrying bucket client shared by the sync engine on every device.
#[derive(Debug)]
pub struct BucketClient {
    inner: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    operations: AtomicU64,
}

impl BucketClient {
    pub fn new(config: &BucketConfig, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            inner: config.build()?,
            retry,
            operations: AtomicU64::new(0),
        })
    }

    /// Wrap an already-built backend. Lets tests share one in-memory bucket
    /// between several clients.
    pub fn with_backend(inner: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self {
            inner,
            retry,
            operations: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            operations: self.operations.load(Ordering::Relaxed),
        }
    }

    /// Fetch an object and its observed version.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Result<(Bytes, RemoteObject)> {
        let path = self.object_path(key)?;
        let inner = self.inner.clone();
        self.retry
            .run("get", || {
                self.count_op();
                let inner = inner.clone();
                let path = path.clone();
                async move {
                    let result = inner.get(&path).await?;
                    let object = RemoteObject::from_meta(&result.meta);
                    let bytes = result.bytes().await?;
                    Ok((bytes, object))
                }
            })
            .await
    }

    /// Fetch object metadata without the body.
    #[instrument(skip(self), level = "debug")]
    pub async fn head(&self, key: &str) -> Result<RemoteObject> {
        let path = self.object_path(key)?;
        let inner = self.inner.clone();
        self.retry
            .run("head", || {
                self.count_op();
                let inner = inner.clone();
                let path = path.clone();
                async move {
                    let meta = inner.head(&path).await?;
                    Ok(RemoteObject::from_meta(&meta))
                }
            })
            .await
    }

    /// Upload an object, honoring the version guard, and return the new
    /// remote version.
    ///
    /// Large payloads go through multipart transfer, which cannot carry a
    /// precondition; the caller detects any lost race on the next listing.
    #[instrument(skip(self, bytes), fields(len = bytes.len()), level = "debug")]
    pub async fn put(&self, key: &str, bytes: Bytes, guard: VersionGuard) -> Result<String> {
        let path = self.object_path(key)?;

        if bytes.len() >= MULTIPART_THRESHOLD {
            return self.put_multipart(&path, bytes).await;
        }

        let mode = match &guard {
            VersionGuard::Any => PutMode::Overwrite,
            VersionGuard::Absent => PutMode::Create,
            VersionGuard::Matches(version) => PutMode::Update(UpdateVersion {
                e_tag: Some(version.clone()),
                version: None,
            }),
        };

        let inner = self.inner.clone();
        let attempt = {
            let mode = mode.clone();
            let path = path.clone();
            let bytes = bytes.clone();
            self.retry
                .run("put", move || {
                    self.count_op();
                    let inner = inner.clone();
                    let path = path.clone();
                    let bytes = bytes.clone();
                    let opts = PutOptions::from(mode.clone());
                    async move { inner.put_opts(&path, PutPayload::from(bytes), opts).await }
                })
                .await
        };

        match attempt {
            Ok(result) => self.version_from_put(&path, result.e_tag).await,
            // Backends without conditional-put support (plain filesystems)
            // degrade to an unconditional overwrite.
            Err(StoreError::Unsupported(_)) if !matches!(guard, VersionGuard::Any) => {
                debug!(key, "backend lacks conditional put, falling back to overwrite");
                let inner = self.inner.clone();
                let result = self
                    .retry
                    .run("put", move || {
                        self.count_op();
                        let inner = inner.clone();
                        let path = path.clone();
                        let bytes = bytes.clone();
                        async move { inner.put(&path, PutPayload::from(bytes)).await }
                    })
                    .await?;
                self.version_from_put(&self.object_path(key)?, result.e_tag)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Delete an object. Deleting a missing key is not an error.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        let inner = self.inner.clone();
        let outcome = self
            .retry
            .run("delete", || {
                self.count_op();
                let inner = inner.clone();
                let path = path.clone();
                async move { inner.delete(&path).await }
            })
            .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// List all objects under a prefix.
    #[instrument(skip(self), level = "debug")]
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<RemoteObject>> {
        let prefix = match prefix {
            Some(p) if !p.is_empty() => Some(self.object_path(p)?),
            _ => None,
        };
        let inner = self.inner.clone();
        let metas: Vec<ObjectMeta> = self
            .retry
            .run("list", || {
                self.count_op();
                let inner = inner.clone();
                let prefix = prefix.clone();
                async move { inner.list(prefix.as_ref()).try_collect().await }
            })
            .await?;
        Ok(metas.iter().map(RemoteObject::from_meta).collect())
    }

    async fn put_multipart(&self, path: &ObjectPath, bytes: Bytes) -> Result<String> {
        self.count_op();
        let upload = self
            .inner
            .put_multipart(path)
            .await
            .map_err(classify)?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, MULTIPART_CHUNK);
        for chunk in bytes.chunks(MULTIPART_CHUNK) {
            writer.write(chunk);
        }
        let result = writer.finish().await.map_err(classify)?;
        self.version_from_put(path, result.e_tag).await
    }

    /// Some backends omit the ETag from put responses; fall back to a head
    /// request so callers always learn the resulting version.
    async fn version_from_put(&self, path: &ObjectPath, e_tag: Option<String>) -> Result<String> {
        if let Some(tag) = e_tag {
            return Ok(tag);
        }
        self.count_op();
        let meta = self.inner.head(path).await.map_err(classify)?;
        Ok(version_of(&meta))
    }

    fn object_path(&self, key: &str) -> Result<ObjectPath> {
        let trimmed = key.trim_start_matches('/');
        ObjectPath::parse(trimmed).map_err(|e| StoreError::InvalidKey {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn count_op(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }
}

fn version_of(meta: &ObjectMeta) -> String {
    meta.e_tag
        .clone()
        .unwrap_or_else(|| meta.last_modified.timestamp_millis().to_string())
}
