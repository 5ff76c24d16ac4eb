use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::BuildCacheService;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::logging::{operations, services, status};

/// Local cache in front of a remote one
///
/// - `load`: local first; on a local miss the remote is asked, and a remote
///   hit is written through to the local cache before being returned
/// - `store`: always local; remote only when `push` is set
///
/// The first remote network failure disables the remote for the rest of the
/// session. Both services are shared handles; their lifecycle belongs to the
/// session that created them.
pub struct CompositeBuildCache {
    local: Arc<dyn BuildCacheService>,
    remote: Arc<dyn BuildCacheService>,
    push: bool,
    remote_disabled: AtomicBool,
}

impl CompositeBuildCache {
    pub fn new(
        local: Arc<dyn BuildCacheService>,
        remote: Arc<dyn BuildCacheService>,
        push: bool,
    ) -> Self {
        Self {
            local,
            remote,
            push,
            remote_disabled: AtomicBool::new(false),
        }
    }

    pub fn remote_disabled(&self) -> bool {
        self.remote_disabled.load(Ordering::Acquire)
    }

    /// Log one warning and stop using the remote on network failures
    fn note_remote_failure(&self, operation: &str, error: &CacheError) {
        if !matches!(error, CacheError::Network { .. }) {
            warn!(
                service = services::COMPOSITE,
                operation = operation,
                status = status::ERROR,
                "Remote cache {} failed: {}",
                operation,
                error
            );
            return;
        }
        if !self.remote_disabled.swap(true, Ordering::AcqRel) {
            warn!(
                service = services::COMPOSITE,
                operation = operation,
                status = status::ERROR,
                "Remote cache {} unavailable, continuing with local cache only: {}",
                self.remote.describe(),
                error
            );
        }
    }
}

#[async_trait]
impl BuildCacheService for CompositeBuildCache {
    fn name(&self) -> &'static str {
        services::COMPOSITE
    }

    fn describe(&self) -> String {
        format!("{} + {}", self.local.describe(), self.remote.describe())
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        match self.local.load(key).await {
            Ok(Some(payload)) => return Ok(Some(payload)),
            Ok(None) => {}
            Err(e) => warn!(key = %key, "Local cache load failed, treating as miss: {}", e),
        }

        if self.remote_disabled() {
            return Ok(None);
        }

        let payload = match self.remote.load(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.note_remote_failure(operations::LOAD, &e);
                return Ok(None);
            }
        };

        // Write-through so the next load is served locally
        if let Err(e) = self.local.store(key, &payload).await {
            warn!(key = %key, "Failed to populate local cache from remote hit: {}", e);
        } else {
            debug!(key = %key, size_bytes = payload.len(), "Populated local cache from remote");
        }

        Ok(Some(payload))
    }

    async fn store(&self, key: &CacheKey, payload: &[u8]) -> Result<()> {
        let local_result = self.local.store(key, payload).await;

        if self.push && !self.remote_disabled() {
            if let Err(e) = self.remote.store(key, payload).await {
                self.note_remote_failure(operations::STORE, &e);
            }
        }

        local_result
    }
}
