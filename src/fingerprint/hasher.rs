/// Per-file content hashing with a metadata-validated digest cache
///
/// A cached digest is reused only while the file's (size, last-modified) pair
/// is unchanged. Files modified within `RACY_WINDOW` of the hash are never
/// cached: a rewrite inside the file system's timestamp granularity would
/// otherwise keep the stale digest.
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

use crate::error::{CacheError, Result};
use crate::key::ContentHash;

const RACY_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct CachedDigest {
    size: u64,
    modified_nanos: u128,
    hash: ContentHash,
}

/// Content hasher shared by every fingerprint computed in a session
#[derive(Debug, Default)]
pub struct FileHasher {
    cache: DashMap<PathBuf, CachedDigest>,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 of the file's contents
    pub fn hash(&self, path: &Path) -> Result<ContentHash> {
        let metadata = fs::metadata(path).map_err(|e| CacheError::io(e, path, "stat"))?;
        let size = metadata.len();
        let modified = metadata
            .modified()
            .map_err(|e| CacheError::io(e, path, "read mtime"))?;
        let modified_nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        if let Some(cached) = self.cache.get(path) {
            if cached.size == size && cached.modified_nanos == modified_nanos {
                trace!(path = %path.display(), "file digest cache hit");
                return Ok(cached.hash);
            }
        }

        let hash = hash_file_content(path)?;

        let racy = SystemTime::now()
            .duration_since(modified)
            .map(|age| age < RACY_WINDOW)
            .unwrap_or(true);
        if racy {
            self.cache.remove(path);
        } else {
            self.cache.insert(
                path.to_path_buf(),
                CachedDigest {
                    size,
                    modified_nanos,
                    hash,
                },
            );
        }

        Ok(hash)
    }

    /// Number of cached digests
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached digest
    pub fn clear(&self) {
        self.cache.clear();
    }
}

/// Stream a file through SHA-256
pub fn hash_file_content(path: &Path) -> Result<ContentHash> {
    let mut file = File::open(path).map_err(|e| CacheError::io(e, path, "open"))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| CacheError::io(e, path, "read"))?;
    Ok(ContentHash::from_hasher(hasher))
}
