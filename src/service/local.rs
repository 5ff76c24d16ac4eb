use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::BuildCacheService;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::logging::{operations, services, status};
use crate::storage::{FilesystemStorage, Storage};

/// Build cache backed by the local entry store
///
/// Store I/O runs on the blocking pool. A corrupt entry is removed by the store
/// and reported here as a miss.
pub struct LocalBuildCache {
    storage: Arc<FilesystemStorage>,
}

impl LocalBuildCache {
    pub fn new(storage: Arc<FilesystemStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<FilesystemStorage> {
        &self.storage
    }
}

#[async_trait]
impl BuildCacheService for LocalBuildCache {
    fn name(&self) -> &'static str {
        services::LOCAL
    }

    fn describe(&self) -> String {
        format!("local:{}", self.storage.root().display())
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let storage = Arc::clone(&self.storage);
        let owned_key = *key;
        let result = tokio::task::spawn_blocking(move || storage.get(&owned_key))
            .await
            .map_err(|e| CacheError::io(std::io::Error::other(e), self.storage.root(), "join load"))?;

        match result {
            Ok(Some(payload)) => {
                debug!(
                    service = services::LOCAL,
                    operation = operations::LOAD,
                    status = status::HIT,
                    key = %key,
                    size_bytes = payload.len(),
                    "Local cache hit"
                );
                Ok(Some(payload))
            }
            Ok(None) => Ok(None),
            Err(e @ CacheError::CorruptEntry { .. }) => {
                warn!(
                    service = services::LOCAL,
                    operation = operations::LOAD,
                    status = status::CORRUPT,
                    key = %key,
                    "Discarded corrupt entry: {}", e
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn store(&self, key: &CacheKey, payload: &[u8]) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        let owned_key = *key;
        let owned_payload = payload.to_vec();
        let size = owned_payload.len();

        tokio::task::spawn_blocking(move || storage.put(&owned_key, &owned_payload))
            .await
            .map_err(|e| CacheError::io(std::io::Error::other(e), self.storage.root(), "join store"))??;

        debug!(
            service = services::LOCAL,
            operation = operations::STORE,
            status = status::SUCCESS,
            key = %key,
            size_bytes = size,
            "Stored entry"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || storage.close())
            .await
            .map_err(|e| CacheError::io(std::io::Error::other(e), self.storage.root(), "join close"))
    }
}
