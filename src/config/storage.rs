//! Storage configuration types.

use std::fmt;

use serde::Deserialize;

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    Filesystem,
    Sqlite,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageType::Memory => "memory",
            StorageType::Filesystem => "filesystem",
            StorageType::Sqlite => "sqlite",
        };
        f.write_str(s)
    }
}

/// Blob storage configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Root directory (filesystem) or database file (sqlite). Unused for memory.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            path: "./data".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn filesystem(path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Filesystem,
            path: path.into(),
        }
    }
}
