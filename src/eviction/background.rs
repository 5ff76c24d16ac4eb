//! Background eviction task
//!
//! Runs eviction asynchronously in a background tokio task, so `store()`
//! is never blocked by housekeeping. The task periodically applies the
//! retention and size policies to the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{EvictionConfig, EvictionManager};
use crate::error::Result;
use crate::eviction::EvictionCandidate;
use crate::key::CacheKey;

/// Trait for storage backends that support background eviction
pub trait EvictableStorage: Send + Sync + 'static {
    /// Get all eviction candidates with their metadata
    fn get_eviction_candidates(&self) -> Result<Vec<EvictionCandidate>>;

    /// Delete an entry by key
    fn delete_object(&self, key: &CacheKey) -> Result<()>;
}

/// Configuration for background eviction task
#[derive(Debug, Clone)]
pub struct BackgroundEvictionConfig {
    /// How often to check if eviction is needed
    pub check_interval: Duration,
    /// Eviction configuration (max_size, retention, etc.)
    pub eviction_config: EvictionConfig,
}

impl Default for BackgroundEvictionConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            eviction_config: EvictionConfig::default(),
        }
    }
}

impl BackgroundEvictionConfig {
    /// Create from eviction config with default check interval
    pub fn from_eviction_config(eviction_config: EvictionConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            eviction_config,
        }
    }

    /// Set the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

/// Handle to control the background eviction task
pub struct BackgroundEvictionHandle {
    /// Signal to stop the background task
    shutdown: Arc<AtomicBool>,
    /// Notify to wake up the task for immediate eviction
    notify: Arc<Notify>,
    /// Join handle for the background task
    join_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BackgroundEvictionHandle {
    /// Trigger an immediate eviction check (non-blocking)
    pub fn trigger_eviction(&self) {
        self.notify.notify_one();
    }

    /// Stop the background eviction task
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();

        if let Some(handle) = self.join_handle.take() {
            // Wait for the task to finish with a timeout
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {
                    debug!("Background eviction task stopped");
                }
                Ok(Err(e)) => {
                    warn!("Background eviction task panicked: {}", e);
                }
                Err(_) => {
                    warn!("Background eviction task did not stop in time");
                }
            }
        }
    }

    /// Check if the background task is still running
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }
}

/// Spawn a background eviction task
///
/// Returns a handle that can be used to control the task.
pub fn spawn_background_eviction<S: EvictableStorage>(
    storage: Arc<S>,
    config: BackgroundEvictionConfig,
) -> BackgroundEvictionHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());

    let shutdown_clone = Arc::clone(&shutdown);
    let notify_clone = Arc::clone(&notify);

    let check_interval = config.check_interval;

    let join_handle = tokio::spawn(async move {
        run_eviction_loop(storage, config, shutdown_clone, notify_clone).await;
    });

    debug!(
        "Background eviction task started (interval: {:?})",
        check_interval
    );

    BackgroundEvictionHandle {
        shutdown,
        notify,
        join_handle: Some(join_handle),
    }
}

/// Main eviction loop
async fn run_eviction_loop<S: EvictableStorage>(
    storage: Arc<S>,
    config: BackgroundEvictionConfig,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    let eviction_manager = Arc::new(EvictionManager::new(config.eviction_config.clone()));

    loop {
        // Wait for either the interval or a manual trigger
        tokio::select! {
            _ = tokio::time::sleep(config.check_interval) => {}
            _ = notify.notified() => {
                if shutdown.load(Ordering::SeqCst) {
                    debug!("Background eviction task received shutdown signal");
                    break;
                }
                debug!("Background eviction triggered manually");
            }
        }

        // Check shutdown again after waking
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Directory scans block
        let storage = Arc::clone(&storage);
        let manager = Arc::clone(&eviction_manager);
        match tokio::task::spawn_blocking(move || manager.run_cycle(storage.as_ref())).await {
            Ok(Ok(_report)) => {}
            Ok(Err(e)) => warn!("Background eviction cycle failed: {}", e),
            Err(e) => warn!("Background eviction cycle panicked: {}", e),
        }
    }

    info!(
        "Background eviction task stopped after {} runs ({} entries evicted)",
        eviction_manager.stats().get_eviction_runs(),
        eviction_manager.stats().get_evictions_total()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::unix_now;
    use crate::key::ContentHash;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn key(tag: u8) -> CacheKey {
        CacheKey::from_hash(ContentHash::of(&[tag]))
    }

    /// Mock storage for testing: key -> (size, accessed_at)
    struct MockStorage {
        objects: Mutex<HashMap<CacheKey, (u64, i64)>>,
    }

    impl MockStorage {
        fn new() -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
            }
        }

        fn add_object(&self, tag: u8, size: u64, accessed_at: i64) {
            self.objects
                .lock()
                .unwrap()
                .insert(key(tag), (size, accessed_at));
        }

        fn object_count(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        fn contains(&self, tag: u8) -> bool {
            self.objects.lock().unwrap().contains_key(&key(tag))
        }

        fn current_size(&self) -> u64 {
            self.objects.lock().unwrap().values().map(|(s, _)| s).sum()
        }
    }

    impl EvictableStorage for MockStorage {
        fn get_eviction_candidates(&self) -> Result<Vec<EvictionCandidate>> {
            let objects = self.objects.lock().unwrap();
            Ok(objects
                .iter()
                .map(|(key, (size, accessed_at))| EvictionCandidate {
                    key: *key,
                    size: *size,
                    accessed_at: *accessed_at,
                })
                .collect())
        }

        fn delete_object(&self, key: &CacheKey) -> Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn config(max_size_bytes: u64, check_interval: Duration) -> BackgroundEvictionConfig {
        BackgroundEvictionConfig {
            check_interval,
            eviction_config: EvictionConfig {
                max_size_bytes,
                target_ratio: 0.9,
                max_evictions_per_run: 100,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_background_eviction_triggers() {
        let storage = Arc::new(MockStorage::new());
        let now = unix_now();

        // Add objects totaling 1500 bytes
        storage.add_object(1, 500, now - 300);
        storage.add_object(2, 500, now - 200);
        storage.add_object(3, 500, now - 100);

        // 1000 bytes max, target 90% = 900 bytes
        let handle = spawn_background_eviction(
            storage.clone(),
            config(1000, Duration::from_millis(50)),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;

        // LRU evicts object 1 (oldest access) then object 2
        let size = storage.current_size();
        assert!(size <= 900, "Expected size <= 900, got {}", size);
        assert!(storage.contains(3));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_eviction_manual_trigger() {
        let storage = Arc::new(MockStorage::new());
        let now = unix_now();
        storage.add_object(1, 100, now);

        let handle = spawn_background_eviction(
            storage.clone(),
            config(500, Duration::from_secs(60)),
        );

        // Exceed the limit after the task started
        storage.add_object(2, 200, now);
        storage.add_object(3, 300, now);
        assert_eq!(storage.current_size(), 600);

        handle.trigger_eviction();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Under 450 (90% of 500)
        let size = storage.current_size();
        assert!(size <= 450, "Expected size <= 450, got {}", size);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_eviction_shutdown() {
        let storage = Arc::new(MockStorage::new());

        let handle = spawn_background_eviction(storage, config(1000, Duration::from_millis(10)));

        assert!(handle.is_running());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_eviction_no_eviction_needed() {
        let storage = Arc::new(MockStorage::new());
        let now = unix_now();
        storage.add_object(1, 100, now - 10);
        storage.add_object(2, 100, now - 20);

        let handle = spawn_background_eviction(
            storage.clone(),
            config(1000, Duration::from_millis(50)),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(storage.object_count(), 2);
        assert_eq!(storage.current_size(), 200);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_retention_removes_stale_entries_under_size_bound() {
        let storage = Arc::new(MockStorage::new());
        let now = unix_now();
        let eight_days = 8 * 24 * 60 * 60;

        storage.add_object(1, 10, now - eight_days);
        storage.add_object(2, 10, now);

        let handle = spawn_background_eviction(
            storage.clone(),
            config(1_000_000, Duration::from_millis(50)),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!storage.contains(1), "stale entry should be removed");
        assert!(storage.contains(2), "fresh entry should be kept");

        handle.shutdown().await;
    }
}
