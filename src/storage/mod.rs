pub mod filesystem;

pub use filesystem::FilesystemStorage;

use std::path::PathBuf;

use crate::error::Result;
use crate::key::CacheKey;

/// Storage backend trait for content-addressed cache entries
pub trait Storage: Send + Sync {
    /// Store a blob under the given key (atomic, idempotent)
    fn put(&self, key: &CacheKey, data: &[u8]) -> Result<()>;

    /// Retrieve a blob by key
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    /// Check if a blob exists
    fn exists(&self, key: &CacheKey) -> Result<bool>;

    /// Delete a blob by key
    fn delete(&self, key: &CacheKey) -> Result<()>;

    /// Record an access for LRU tracking
    fn touch(&self, key: &CacheKey) -> Result<()>;

    /// List all stored keys (for eviction/cleanup)
    fn list_keys(&self) -> Result<Vec<CacheKey>>;

    /// Get cache statistics
    fn stats(&self) -> Result<StorageStats>;
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_objects: u64,
    pub total_bytes: u64,
    pub cache_dir: PathBuf,
}
