//! Build cache services
//!
//! Every cache the engine talks to implements [`BuildCacheService`]. The
//! concrete service for a session is chosen once by the factory:
//!
//! | local | remote | service                 |
//! |-------|--------|-------------------------|
//! | on    | on     | [`CompositeBuildCache`] |
//! | on    | off    | [`LocalBuildCache`]     |
//! | off   | on     | [`HttpBuildCache`]      |
//! | off   | off    | [`NoOpBuildCache`]      |

mod composite;
pub mod factory;
mod local;
mod remote;

pub use composite::CompositeBuildCache;
pub use factory::{CacheSession, RemoteBuilder, RemoteRegistry};
pub use local::LocalBuildCache;
pub use remote::{HttpBuildCache, RemoteCredentials};

use async_trait::async_trait;

use crate::error::Result;
use crate::key::CacheKey;
use crate::logging::services;

/// A store of cache entries addressed by [`CacheKey`]
///
/// `load` returns `Ok(None)` on a miss. Errors are reported, not swallowed;
/// whether an error degrades to a miss is the caller's decision.
#[async_trait]
pub trait BuildCacheService: Send + Sync {
    /// Short service name for logs
    fn name(&self) -> &'static str;

    /// Human-readable description of where entries live
    fn describe(&self) -> String;

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    async fn store(&self, key: &CacheKey, payload: &[u8]) -> Result<()>;

    /// Release resources; called once when the session ends
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Caching disabled: every load misses, every store succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpBuildCache;

#[async_trait]
impl BuildCacheService for NoOpBuildCache {
    fn name(&self) -> &'static str {
        services::NOOP
    }

    fn describe(&self) -> String {
        "disabled".to_string()
    }

    async fn load(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn store(&self, _key: &CacheKey, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}
