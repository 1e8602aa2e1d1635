//! Durable storage for finished extracts
//!
//! The dispatcher only sees the [`Storage`] trait. [`ObjectStoreStorage`] implements it
//! on top of the `object_store` crate so the same code path serves S3, a local directory,
//! or an in-memory store.

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Where an artifact lives in storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Bucket (empty for stores without buckets)
    pub bucket: String,
    /// Object key: base directory joined with the path suffix
    pub key: String,
}

/// Durable storage collaborator
///
/// Implementations must be safe to call concurrently from every worker.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Resolve where `path_suffix` would be stored, without touching the store
    fn location(&self, path_suffix: &str) -> StoredObject;

    /// Upload the local file at `local` under `path_suffix`
    async fn put(&self, path_suffix: &str, local: &Path) -> Result<StoredObject>;

    /// Delete the object stored under `path_suffix`
    async fn delete(&self, path_suffix: &str) -> Result<()>;
}

/// [`Storage`] backed by any `object_store` implementation
#[derive(Clone, Debug)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    base_dir: String,
}

impl ObjectStoreStorage {
    /// Wrap an existing store
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, base_dir: &str) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            base_dir: base_dir.trim_matches('/').to_string(),
        }
    }

    /// In-memory store, mostly useful for tests and dry runs
    pub fn in_memory(base_dir: &str) -> Self {
        Self::new(Arc::new(InMemory::new()), "memory", base_dir)
    }

    /// Build the store described by configuration
    ///
    /// S3 credentials and region fall back to the standard `AWS_*` environment variables.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let url = config.store_url()?;
        let bucket = url.host_str().unwrap_or_default().to_string();

        match url.scheme() {
            "s3" | "s3a" => {
                let base_dir = join_key(url.path(), &config.base_dir);
                let mut builder = AmazonS3Builder::from_env().with_url(url.as_str());
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(key_id) = &config.access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                let store = builder.build()?;
                tracing::info!(bucket = %bucket, base_dir = %base_dir, "using S3 storage");
                Ok(Self::new(Arc::new(store), bucket, &base_dir))
            }
            _ => {
                let (store, prefix) = object_store::parse_url(&url)?;
                let base_dir = join_key(prefix.as_ref(), &config.base_dir);
                tracing::info!(url = %url, base_dir = %base_dir, "using object storage");
                Ok(Self::new(Arc::from(store), bucket, &base_dir))
            }
        }
    }

    /// Underlying store
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    fn key(&self, path_suffix: &str) -> String {
        join_key(&self.base_dir, path_suffix)
    }
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    fn location(&self, path_suffix: &str) -> StoredObject {
        StoredObject {
            bucket: self.bucket.clone(),
            key: self.key(path_suffix),
        }
    }

    async fn put(&self, path_suffix: &str, local: &Path) -> Result<StoredObject> {
        let location = self.location(path_suffix);
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(upload_error)?;
        let mut writer = BufWriter::new(
            Arc::clone(&self.store),
            ObjectPath::from(location.key.as_str()),
        );

        tokio::io::copy(&mut file, &mut writer)
            .await
            .map_err(upload_error)?;
        writer.shutdown().await.map_err(upload_error)?;

        tracing::debug!(bucket = %location.bucket, key = %location.key, "uploaded extract");
        Ok(location)
    }

    async fn delete(&self, path_suffix: &str) -> Result<()> {
        let key = self.key(path_suffix);
        self.store.delete(&ObjectPath::from(key.as_str())).await?;
        Ok(())
    }
}

fn upload_error(source: std::io::Error) -> Error {
    Error::Storage(object_store::Error::Generic {
        store: "upload",
        source: Box::new(source),
    })
}

fn join_key(base: &str, suffix: &str) -> String {
    let base = base.trim_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if base.is_empty() {
        suffix.to_string()
    } else {
        format!("{base}/{suffix}")
    }
}
