// Common test utilities shared across integration tests
//
// Every test gets its own workspace, cache directory and state directory
// under a single TempDir, so tests run in parallel without sharing state.

#![allow(dead_code)]

use async_trait::async_trait;
use cachet::engine::IncrementalEngine;
use cachet::service::{BuildCacheService, LocalBuildCache};
use cachet::state::TaskStateStore;
use cachet::{CacheError, CacheKey, FilesystemStorage, Result};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Isolated workspace with `work/`, `cache/` and `state/` directories
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("work")).unwrap();
        Self { temp_dir }
    }

    /// Base directory for units of work
    pub fn work(&self) -> PathBuf {
        self.temp_dir.path().join("work")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.temp_dir.path().join("cache")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp_dir.path().join("state")
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.work().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.work().join(relative)).unwrap()
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.work().join(relative).exists()
    }

    pub fn local_storage(&self) -> Arc<FilesystemStorage> {
        Arc::new(FilesystemStorage::new(self.cache_dir()).unwrap())
    }

    pub fn state_store(&self) -> Arc<TaskStateStore> {
        Arc::new(TaskStateStore::open(self.state_dir()).unwrap())
    }

    /// Engine over a local-only build cache
    pub fn local_engine(&self) -> (IncrementalEngine, Arc<FilesystemStorage>) {
        let storage = self.local_storage();
        let service: Arc<dyn BuildCacheService> = Arc::new(LocalBuildCache::new(Arc::clone(&storage)));
        let engine = IncrementalEngine::new(self.state_store(), service, CancellationToken::new());
        (engine, storage)
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// In-memory build cache counting remote-style calls
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
    pub loads: AtomicUsize,
    pub stores: AtomicUsize,
}

impl MemoryCache {
    pub fn insert(&self, key: CacheKey, payload: Vec<u8>) {
        self.entries.lock().unwrap().insert(key, payload);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl BuildCacheService for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn store(&self, key: &CacheKey, payload: &[u8]) -> Result<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.insert(*key, payload.to_vec());
        Ok(())
    }
}

/// Remote that serves from memory for `healthy_calls` calls, then fails
pub struct FlakyRemote {
    inner: MemoryCache,
    healthy_calls: usize,
    pub calls: AtomicUsize,
}

impl FlakyRemote {
    pub fn new(healthy_calls: usize) -> Self {
        Self {
            inner: MemoryCache::default(),
            healthy_calls,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every call
    pub fn broken() -> Self {
        Self::new(0)
    }

    pub fn seed(&self, key: CacheKey, payload: Vec<u8>) {
        self.inner.insert(key, payload);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.healthy_calls {
            return Err(CacheError::network(operation, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl BuildCacheService for FlakyRemote {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn describe(&self) -> String {
        "flaky".to_string()
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        self.check("load")?;
        self.inner.load(key).await
    }

    async fn store(&self, key: &CacheKey, payload: &[u8]) -> Result<()> {
        self.check("store")?;
        self.inner.store(key, payload).await
    }
}

/// Remote whose lookups cancel the build mid-request
pub struct CancellingRemote {
    cancel: CancellationToken,
    pub loads: AtomicUsize,
}

impl CancellingRemote {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BuildCacheService for CancellingRemote {
    fn name(&self) -> &'static str {
        "cancelling"
    }

    fn describe(&self) -> String {
        "cancelling".to_string()
    }

    async fn load(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        Err(CacheError::network("load", "cancelled"))
    }

    async fn store(&self, _key: &CacheKey, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// In-process HTTP cache server on a random port
pub struct TestServer {
    pub addr: SocketAddr,
    pub storage: Arc<FilesystemStorage>,
    _dir: TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FilesystemStorage::new(dir.path()).unwrap());
        let shared: Arc<dyn cachet::Storage> = storage.clone();
        let app = cachet::http::router(shared);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            storage,
            _dir: dir,
            handle,
        }
    }

    /// Base URL of the cache endpoints
    pub fn cache_url(&self) -> String {
        format!("http://{}/cache/", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
