//! Blob storage for capture segments and snapshots.
//!
//! Both the capture archive and the snapshot store are flat namespaces of
//! immutable blobs addressed by `/`-separated names. Blobs are never
//! overwritten: [`BlobStore::put_if_absent`] reports whether it wrote.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;

use crate::config::{StorageConfig, StorageType};

pub mod filesystem;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use filesystem::FsBlobStore;
pub use memory::InMemoryBlobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBlobStore;

/// Errors that can occur during blob storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage type '{0}' requires the '{0}' feature")]
    FeatureDisabled(StorageType),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Flat blob namespace with create-only writes.
///
/// Implementations:
/// - `InMemoryBlobStore`: process-local, for tests and standalone runs
/// - `FsBlobStore`: local directory tree
/// - `SqliteBlobStore`: single SQLite table (feature `sqlite`)
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Names starting with `prefix`, sorted lexicographically.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Contents of a blob, or `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Bytes>>;

    /// Write a blob unless one with the same name exists.
    ///
    /// Returns `true` if the blob was written, `false` if it already existed.
    async fn put_if_absent(&self, name: &str, data: Bytes) -> Result<bool>;
}

/// Read a blob that must exist.
pub async fn open_blob(store: &dyn BlobStore, name: &str) -> Result<Bytes> {
    store
        .get(name)
        .await?
        .ok_or_else(|| StorageError::NotFound(name.to_string()))
}

/// Initialize a blob store based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    info!(storage_type = %config.storage_type, path = %config.path, "Initializing blob storage");

    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(InMemoryBlobStore::new())),
        StorageType::Filesystem => Ok(Arc::new(FsBlobStore::open(&config.path).await?)),
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => Ok(Arc::new(SqliteBlobStore::connect(&config.path).await?)),
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::FeatureDisabled(StorageType::Sqlite))
        }
    }
}
