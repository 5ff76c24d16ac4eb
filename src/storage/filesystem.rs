use super::{Storage, StorageStats};
use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::eviction::{EvictableStorage, EvictionCandidate};
use crate::key::CacheKey;

/// Entry header: magic followed by the SHA-256 of the payload
///
/// ```text
/// +----------------+------------------+-----------------+
/// | "CACHET\x01\n" | sha256(payload)  | payload ...     |
/// |    8 bytes     |    32 bytes      |                 |
/// +----------------+------------------+-----------------+
/// ```
const ENTRY_MAGIC: &[u8; 8] = b"CACHET\x01\n";
const HEADER_LEN: usize = 8 + 32;

/// Message type for batched access tracking updates
#[derive(Debug, Clone)]
struct TouchMessage {
    path: PathBuf,
    accessed_at: SystemTime,
}

/// Filesystem-based content-addressed entry store
///
/// Layout:
/// - `<root>/objects/ab/cd1234...` - entries, first 2 hex chars = shard dir
///
/// Writes go to a temp file inside the shard directory and are renamed into
/// place, so readers in this or any other process never observe a partial
/// entry. Within the process there is at most one writer per key.
///
/// The last-modified time of an entry doubles as its last access time; loads
/// send touches to a background worker which applies them in batches.
pub struct FilesystemStorage {
    root: PathBuf,
    objects_dir: PathBuf,
    key_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    touch_sender: Mutex<Option<Sender<TouchMessage>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FilesystemStorage {
    /// Open (creating if needed) a store rooted at the given cache directory
    ///
    /// Spawns a background worker for batched access tracking.
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> Result<Self> {
        let root = cache_dir.as_ref().to_path_buf();
        let objects_dir = root.join("objects");

        fs::create_dir_all(&objects_dir)
            .map_err(|e| CacheError::io(e, &objects_dir, "create objects directory"))?;

        // Buffered for batching
        let (touch_sender, touch_receiver) = bounded::<TouchMessage>(1000);

        let worker_handle = thread::Builder::new()
            .name("cachet-touch".to_string())
            .spawn(move || {
                let mut batch = Vec::with_capacity(100);
                let batch_timeout = Duration::from_millis(100);

                loop {
                    match touch_receiver.recv_timeout(batch_timeout) {
                        Ok(msg) => {
                            batch.push(msg);
                            while batch.len() < 100 {
                                match touch_receiver.try_recv() {
                                    Ok(msg) => batch.push(msg),
                                    Err(_) => break,
                                }
                            }
                            Self::batch_touch(&batch);
                            batch.clear();
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            if !batch.is_empty() {
                                Self::batch_touch(&batch);
                                batch.clear();
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                            Self::batch_touch(&batch);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| CacheError::io(e, &root, "spawn touch worker"))?;

        Ok(Self {
            root,
            objects_dir,
            key_locks: DashMap::new(),
            touch_sender: Mutex::new(Some(touch_sender)),
            worker_handle: Mutex::new(Some(worker_handle)),
        })
    }

    /// Apply access times for a batch of entries
    fn batch_touch(batch: &[TouchMessage]) {
        let mut applied = 0usize;
        for msg in batch {
            let result = fs::OpenOptions::new()
                .write(true)
                .open(&msg.path)
                .and_then(|file| file.set_modified(msg.accessed_at));
            match result {
                Ok(()) => applied += 1,
                // Evicted or replaced since the load
                Err(e) => debug!("Failed to touch {}: {}", msg.path.display(), e),
            }
        }
        if applied > 0 {
            debug!("Batched {} access tracking updates", applied);
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop the touch worker after it has flushed pending updates
    ///
    /// Idempotent; also runs on drop.
    pub fn close(&self) {
        let sender = lock(&self.touch_sender).take();
        drop(sender);

        if let Some(handle) = lock(&self.worker_handle).take() {
            if handle.join().is_err() {
                warn!("Touch worker panicked during shutdown");
            }
        }
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        if self.objects_dir.exists() {
            fs::remove_dir_all(&self.objects_dir)
                .map_err(|e| CacheError::io(e, &self.objects_dir, "remove objects directory"))?;
        }
        fs::create_dir_all(&self.objects_dir)
            .map_err(|e| CacheError::io(e, &self.objects_dir, "create objects directory"))?;
        Ok(())
    }

    /// Convert key to filesystem path
    /// Uses git-style sharding: first 2 hex chars as subdirectory
    fn key_to_path(&self, key: &CacheKey) -> PathBuf {
        let hex_key = key.to_hex();
        let (prefix, suffix) = hex_key.split_at(2);
        self.objects_dir.join(prefix).join(suffix)
    }

    /// Inverse of `key_to_path`; None for temp files and strays
    fn path_to_key(&self, path: &Path) -> Option<CacheKey> {
        let suffix = path.file_name()?.to_str()?;
        let prefix = path.parent()?.file_name()?.to_str()?;
        CacheKey::from_hex(&format!("{prefix}{suffix}")).ok()
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        Arc::clone(self.key_locks.entry(*key).or_default().value())
    }

    fn release_key_lock(&self, key: &CacheKey) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Whether a complete entry holding exactly `digest` is already on disk
    fn holds_digest(path: &Path, digest: &[u8]) -> bool {
        let mut header = [0u8; HEADER_LEN];
        match fs::File::open(path).and_then(|mut f| f.read_exact(&mut header)) {
            Ok(()) => &header[..8] == ENTRY_MAGIC && &header[8..] == digest,
            Err(_) => false,
        }
    }

    fn write_entry(&self, key: &CacheKey, path: &Path, data: &[u8]) -> Result<()> {
        let digest = Sha256::digest(data);
        if Self::holds_digest(path, &digest) {
            debug!(key = %key, "Entry already present, skipping write");
            return Ok(());
        }

        let parent = path
            .parent()
            .ok_or_else(|| CacheError::configuration("entry path has no parent"))?;
        fs::create_dir_all(parent).map_err(|e| CacheError::io(e, parent, "create shard"))?;

        let mut temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(parent)
            .map_err(|e| CacheError::io(e, parent, "create temp file"))?;
        temp.write_all(ENTRY_MAGIC)
            .and_then(|_| temp.write_all(&digest))
            .and_then(|_| temp.write_all(data))
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| CacheError::io(e, temp.path(), "write entry"))?;
        temp.persist(path)
            .map_err(|e| CacheError::io(e.error, path, "rename entry"))?;

        Ok(())
    }

    fn decode_entry(key: &CacheKey, mut bytes: Vec<u8>) -> Result<Vec<u8>> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheError::corrupt(key, "truncated header"));
        }
        if &bytes[..8] != ENTRY_MAGIC {
            return Err(CacheError::corrupt(key, "bad magic"));
        }
        let payload = bytes.split_off(HEADER_LEN);
        if Sha256::digest(&payload).as_slice() != &bytes[8..HEADER_LEN] {
            return Err(CacheError::corrupt(key, "digest mismatch"));
        }
        Ok(payload)
    }

    /// (key, size, accessed_at) for every entry
    fn scan(&self) -> Result<Vec<(CacheKey, u64, i64)>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.objects_dir).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                // Concurrent removal of a shard
                Err(e) if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => {
                    continue
                }
                Err(e) => {
                    let path = e.path().unwrap_or(&self.objects_dir).to_path_buf();
                    return Err(CacheError::io(e.into(), path, "scan entries"));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = self.path_to_key(entry.path()) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let accessed_at = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            entries.push((key, metadata.len(), accessed_at));
        }
        Ok(entries)
    }
}

impl Drop for FilesystemStorage {
    fn drop(&mut self) {
        self.close();
    }
}

impl Storage for FilesystemStorage {
    fn put(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
        let path = self.key_to_path(key);
        let key_lock = self.key_lock(key);
        let result = {
            let _guard = lock(&key_lock);
            self.write_entry(key, &path, data)
        };
        drop(key_lock);
        self.release_key_lock(key);
        result
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let path = self.key_to_path(key);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(e, &path, "read entry")),
        };

        match Self::decode_entry(key, bytes) {
            Ok(payload) => {
                self.touch(key)?;
                Ok(Some(payload))
            }
            Err(e) => {
                // Next store of this key rewrites it
                if let Err(remove_err) = fs::remove_file(&path) {
                    debug!("Failed to remove corrupt entry {}: {}", key, remove_err);
                }
                Err(e)
            }
        }
    }

    fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.key_to_path(key).exists())
    }

    fn delete(&self, key: &CacheKey) -> Result<()> {
        let path = self.key_to_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(e, &path, "delete entry")),
        }
    }

    fn touch(&self, key: &CacheKey) -> Result<()> {
        let msg = TouchMessage {
            path: self.key_to_path(key),
            accessed_at: SystemTime::now(),
        };

        // Dropped when the channel is full or closed; access tracking is best effort
        if let Some(sender) = lock(&self.touch_sender).as_ref() {
            sender.try_send(msg).ok();
        }

        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<CacheKey>> {
        Ok(self.scan()?.into_iter().map(|(key, _, _)| key).collect())
    }

    fn stats(&self) -> Result<StorageStats> {
        let entries = self.scan()?;
        Ok(StorageStats {
            total_objects: entries.len() as u64,
            total_bytes: entries.iter().map(|(_, size, _)| size).sum(),
            cache_dir: self.root.clone(),
        })
    }
}

impl EvictableStorage for FilesystemStorage {
    fn get_eviction_candidates(&self) -> Result<Vec<EvictionCandidate>> {
        Ok(self
            .scan()?
            .into_iter()
            .map(|(key, size, accessed_at)| EvictionCandidate {
                key,
                size,
                accessed_at,
            })
            .collect())
    }

    fn delete_object(&self, key: &CacheKey) -> Result<()> {
        self.delete(key)
    }
}

/// Lock ignoring poisoning; the guarded data is `()` or an Option handle
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ContentHash;
    use tempfile::TempDir;

    fn key(data: &[u8]) -> CacheKey {
        CacheKey::from_hash(ContentHash::of(data))
    }

    #[test]
    fn test_filesystem_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();

        let id = key(b"hello");
        storage.put(&id, b"hello world").unwrap();

        let data = storage.get(&id).unwrap();
        assert_eq!(data, Some(b"hello world".to_vec()));

        assert!(storage.exists(&id).unwrap());

        let stats = storage.stats().unwrap();
        assert_eq!(stats.total_objects, 1);
        assert_eq!(stats.total_bytes, (HEADER_LEN + 11) as u64);

        storage.delete(&id).unwrap();
        assert!(!storage.exists(&id).unwrap());
        assert_eq!(storage.get(&id).unwrap(), None);
    }

    #[test]
    fn test_sharded_layout() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        let id = key(b"layout");
        storage.put(&id, b"x").unwrap();

        let hex_key = id.to_hex();
        let expected = temp_dir
            .path()
            .join("objects")
            .join(&hex_key[..2])
            .join(&hex_key[2..]);
        assert!(expected.is_file());
        assert_eq!(storage.list_keys().unwrap(), vec![id]);
    }

    #[test]
    fn test_put_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        let id = key(b"same");

        storage.put(&id, b"payload").unwrap();
        let first = storage.stats().unwrap();
        storage.put(&id, b"payload").unwrap();
        let second = storage.stats().unwrap();

        assert_eq!(first.total_objects, second.total_objects);
        assert_eq!(first.total_bytes, second.total_bytes);
        assert_eq!(storage.get(&id).unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_corrupt_entry_is_reported_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        let id = key(b"corrupt");
        storage.put(&id, b"good bytes").unwrap();

        let path = storage.key_to_path(&id);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = storage.get(&id).unwrap_err();
        assert!(matches!(err, CacheError::CorruptEntry { .. }));
        assert!(!path.exists());

        // Rewriting the key repairs it
        storage.put(&id, b"good bytes").unwrap();
        assert_eq!(storage.get(&id).unwrap(), Some(b"good bytes".to_vec()));
    }

    #[test]
    fn test_concurrent_writers_same_key() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(FilesystemStorage::new(temp_dir.path()).unwrap());
        let id = key(b"contended");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || storage.put(&id, b"identical payload").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            storage.get(&id).unwrap(),
            Some(b"identical payload".to_vec())
        );
        assert_eq!(storage.stats().unwrap().total_objects, 1);
        assert!(storage.key_locks.is_empty());
    }

    #[test]
    fn test_touch_updates_access_time() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        let id = key(b"touched");
        storage.put(&id, b"data").unwrap();

        let path = storage.key_to_path(&id);
        let old = SystemTime::now() - Duration::from_secs(86_400);
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        storage.get(&id).unwrap();
        // close() flushes pending touches
        storage.close();

        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(modified > old + Duration::from_secs(3600));
    }

    #[test]
    fn test_eviction_cycle_removes_least_recently_used() {
        use crate::eviction::{EvictionConfig, EvictionManager};

        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        let now = SystemTime::now();

        let keys: Vec<_> = (0u8..3).map(|i| key(&[i])).collect();
        for (age_hours, id) in [3u64, 1, 2].iter().zip(&keys) {
            storage.put(id, &[0u8; 100]).unwrap();
            fs::OpenOptions::new()
                .write(true)
                .open(storage.key_to_path(id))
                .unwrap()
                .set_modified(now - Duration::from_secs(age_hours * 3600))
                .unwrap();
        }

        let entry_size = (HEADER_LEN + 100) as u64;
        let manager = EvictionManager::new(EvictionConfig {
            max_size_bytes: entry_size * 2,
            target_ratio: 1.0,
            ..Default::default()
        });
        let report = manager.run_cycle(&storage).unwrap();

        assert_eq!(report.evicted, 1);
        assert_eq!(report.expired, 0);
        assert!(!storage.exists(&keys[0]).unwrap());
        assert!(storage.exists(&keys[1]).unwrap());
        assert!(storage.exists(&keys[2]).unwrap());
    }

    #[test]
    fn test_clear_removes_everything() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        storage.put(&key(b"a"), b"a").unwrap();
        storage.put(&key(b"b"), b"b").unwrap();

        storage.clear().unwrap();
        assert_eq!(storage.stats().unwrap().total_objects, 0);
    }
}
