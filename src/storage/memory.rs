//! In-memory blob store.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BlobStore, Result, StorageError};

/// Blob store kept in process memory.
///
/// Failure and latency knobs let tests exercise transient storage errors
/// and slow writers.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
    fail_on_put: RwLock<bool>,
    fail_on_list: RwLock<bool>,
    put_delay: RwLock<Option<Duration>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_put(&self, fail: bool) {
        *self.fail_on_put.write().await = fail;
    }

    pub async fn set_fail_on_list(&self, fail: bool) {
        *self.fail_on_list.write().await = fail;
    }

    pub async fn set_put_delay(&self, delay: Option<Duration>) {
        *self.put_delay.write().await = delay;
    }

    /// All stored names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if *self.fail_on_list.read().await {
            return Err(StorageError::Unavailable("list failure injected".to_string()));
        }
        let blobs = self.blobs.read().await;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn put_if_absent(&self, name: &str, data: Bytes) -> Result<bool> {
        let delay = *self.put_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_on_put.read().await {
            return Err(StorageError::Unavailable("put failure injected".to_string()));
        }
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(name) {
            return Ok(false);
        }
        blobs.insert(name.to_string(), data);
        Ok(true)
    }
}
