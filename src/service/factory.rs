//! Cache service factory and session lifecycle

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BuildCacheService, CompositeBuildCache, HttpBuildCache, LocalBuildCache, NoOpBuildCache};
use crate::config::{CacheConfig, RemoteCacheConfig};
use crate::error::{CacheError, Result};
use crate::eviction::{spawn_background_eviction, BackgroundEvictionConfig, BackgroundEvictionHandle};
use crate::storage::FilesystemStorage;

/// Builds a remote service from the `[remote]` section
pub type RemoteBuilder =
    fn(&RemoteCacheConfig, CancellationToken) -> Result<Arc<dyn BuildCacheService>>;

/// Remote type name to builder
///
/// Comes with `http` registered. Unknown types are configuration errors.
#[derive(Clone)]
pub struct RemoteRegistry {
    builders: BTreeMap<String, RemoteBuilder>,
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        let mut registry = Self {
            builders: BTreeMap::new(),
        };
        registry.register("http", build_http);
        registry
    }
}

fn build_http(
    config: &RemoteCacheConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn BuildCacheService>> {
    Ok(Arc::new(HttpBuildCache::from_config(config, cancel)?))
}

impl RemoteRegistry {
    pub fn register(&mut self, kind: impl Into<String>, builder: RemoteBuilder) {
        self.builders.insert(kind.into(), builder);
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        config: &RemoteCacheConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn BuildCacheService>> {
        let builder = self.builders.get(&config.kind).ok_or_else(|| {
            CacheError::configuration(format!(
                "unknown remote cache type '{}' (known: {})",
                config.kind,
                self.types().collect::<Vec<_>>().join(", ")
            ))
        })?;
        builder(config, cancel)
    }
}

/// Validate a configuration including the remote type
pub fn validate(config: &CacheConfig, registry: &RemoteRegistry) -> Result<()> {
    config.validate()?;
    if config.remote.enabled && !registry.builders.contains_key(&config.remote.kind) {
        return Err(CacheError::configuration(format!(
            "unknown remote cache type '{}'",
            config.remote.kind
        )));
    }
    Ok(())
}

/// Cache services for one build
///
/// Opened at build start: validates the configuration, opens the local store,
/// starts background eviction and builds the service the engine talks to.
/// [`CacheSession::close`] stops eviction and flushes pending access updates.
pub struct CacheSession {
    service: Arc<dyn BuildCacheService>,
    local: Option<Arc<FilesystemStorage>>,
    eviction: Option<BackgroundEvictionHandle>,
    cancel: CancellationToken,
}

impl CacheSession {
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        Self::open_with(config, &RemoteRegistry::default(), CancellationToken::new()).await
    }

    /// Open with a custom remote registry and a caller-owned cancellation token
    pub async fn open_with(
        config: &CacheConfig,
        registry: &RemoteRegistry,
        cancel: CancellationToken,
    ) -> Result<Self> {
        validate(config, registry)?;

        let (local_service, local, eviction) = if config.local.enabled {
            let dir = config.local_dir();
            let storage = Arc::new(FilesystemStorage::new(&dir)?);
            let eviction = spawn_background_eviction(
                Arc::clone(&storage),
                BackgroundEvictionConfig::from_eviction_config(config.eviction_config()?)
                    .with_check_interval(config.eviction_interval()?),
            );
            let service: Arc<dyn BuildCacheService> =
                Arc::new(LocalBuildCache::new(Arc::clone(&storage)));
            (Some(service), Some(storage), Some(eviction))
        } else {
            (None, None, None)
        };

        let remote_service = if config.remote.enabled {
            Some(registry.build(&config.remote, cancel.clone())?)
        } else {
            None
        };

        let service: Arc<dyn BuildCacheService> = match (local_service, remote_service) {
            (Some(local), Some(remote)) => Arc::new(CompositeBuildCache::new(
                local,
                remote,
                config.remote.push,
            )),
            (Some(local), None) => local,
            (None, Some(remote)) => remote,
            (None, None) => Arc::new(NoOpBuildCache),
        };

        info!("Build cache: {}", service.describe());

        Ok(Self {
            service,
            local,
            eviction,
            cancel,
        })
    }

    /// The service selected for this session
    pub fn service(&self) -> Arc<dyn BuildCacheService> {
        Arc::clone(&self.service)
    }

    /// Local entry store, when local caching is enabled
    pub fn local_storage(&self) -> Option<&Arc<FilesystemStorage>> {
        self.local.as_ref()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask background eviction to run now
    pub fn trigger_eviction(&self) {
        if let Some(eviction) = &self.eviction {
            eviction.trigger_eviction();
        }
    }

    /// Stop eviction and flush the local store
    pub async fn close(self) -> Result<()> {
        if let Some(eviction) = self.eviction {
            eviction.shutdown().await;
        }

        if let Err(e) = self.service.close().await {
            warn!("Failed to close cache service: {}", e);
        }

        // Composite and remote-only sessions do not close the local store
        // through the service
        if let Some(storage) = self.local {
            tokio::task::spawn_blocking(move || storage.close())
                .await
                .map_err(|e| CacheError::io(std::io::Error::other(e), "", "join close"))?;
        }

        debug!("Cache session closed");
        Ok(())
    }
}
