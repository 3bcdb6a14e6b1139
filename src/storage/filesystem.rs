//! Filesystem blob store.
//!
//! Blob names map onto relative paths under a root directory. Writes go to
//! a temporary sibling first and are published with a hard link, which
//! fails atomically when the target exists. Readers never see partial blobs.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use super::{BlobStore, Result, StorageError};

const TEMP_MARKER: &str = ".tmp-";

/// Blob store rooted at a local directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Deepest directory every name starting with `prefix` lives under.
    pub(super) fn walk_start(&self, prefix: &str) -> PathBuf {
        let Some((dir, _)) = prefix.rsplit_once('/') else {
            return self.root.clone();
        };
        let relative = Path::new(dir);
        if relative.components().all(|c| matches!(c, Component::Normal(_))) {
            self.root.join(relative)
        } else {
            self.root.clone()
        }
    }

    fn name_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![self.walk_start(prefix)];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(name) = self.name_for(&path) else {
                    continue;
                };
                if name.contains(TEMP_MARKER) || !name.starts_with(prefix) {
                    continue;
                }
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_if_absent(&self, name: &str, data: Bytes) -> Result<bool> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidName(name.to_string()))?;
        let temp = path.with_file_name(format!("{}{}{}", file_name, TEMP_MARKER, Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        let published = tokio::fs::hard_link(&temp, &path).await;
        tokio::fs::remove_file(&temp).await?;

        match published {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(blob = %name, "Blob already exists, not overwriting");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
