//! Backend selection for the bucket client.

use std::path::PathBuf;
use std::sync::Arc;

use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::error::{classify, Result};

/// Where the bucket lives.
///
/// `S3` is the production configuration (any S3-compatible endpoint,
/// including Cloudflare R2 and MinIO). `Local` and `Memory` exist for tests
/// and offline experiments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum BucketConfig {
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
        #[serde(default)]
        allow_http: bool,
    },
    Local {
        path: PathBuf,
    },
    Memory,
}

impl BucketConfig {
    /// Build the underlying [`ObjectStore`] implementation.
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            BucketConfig::S3 {
                bucket,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
                allow_http,
            } => {
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_access_key_id(access_key_id)
                    .with_secret_access_key(secret_access_key)
                    .with_conditional_put(S3ConditionalPut::ETagMatch)
                    .with_allow_http(*allow_http);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let store = builder.build().map_err(classify)?;
                Ok(Arc::new(store))
            }
            BucketConfig::Local { path } => {
                std::fs::create_dir_all(path).map_err(|e| crate::StoreError::InvalidKey {
                    key: path.display().to_string(),
                    message: e.to_string(),
                })?;
                let store = LocalFileSystem::new_with_prefix(path).map_err(classify)?;
                Ok(Arc::new(store))
            }
            BucketConfig::Memory => Ok(Arc::new(InMemory::new())),
        }
    }
}
