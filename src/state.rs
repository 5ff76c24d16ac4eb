//! Execution state store
//!
//! One [`TaskExecutionState`] per unit identity, kept in RocksDB under the
//! state directory. Records are JSON; a record that no longer decodes is
//! treated as absent.

use chrono::{DateTime, Utc};
use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::engine::Outcome;
use crate::error::{CacheError, Result};
use crate::fingerprint::{InputFingerprint, OutputSnapshot};
use crate::key::{CacheKey, ContentHash};

/// What was recorded after the last successful execution or restoration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionState {
    pub identity: String,
    /// Input fingerprint taken before the work ran
    pub inputs: InputFingerprint,
    /// Hash of the unit's implementation string
    pub implementation: ContentHash,
    pub outputs: OutputSnapshot,
    pub cacheable: bool,
    pub cache_key: Option<CacheKey>,
    pub recorded_at: DateTime<Utc>,
    /// EXECUTED or CACHE_HIT
    pub origin: Outcome,
}

/// Point-lookup store of execution states keyed by unit identity
pub struct TaskStateStore {
    db: DB,
    path: PathBuf,
}

impl TaskStateStore {
    pub fn open<P: AsRef<Path>>(state_dir: P) -> Result<Self> {
        let path = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| CacheError::io(e, &path, "create state directory"))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(2);
        opts.set_statistics_level(rocksdb::statistics::StatsLevel::DisableAll);

        let db = DB::open(&opts, &path).map_err(|e| {
            CacheError::state(format!(
                "failed to open state store at {}: {e}",
                path.display()
            ))
        })?;

        debug!("Opened execution state store at {}", path.display());
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, identity: &str) -> Result<Option<TaskExecutionState>> {
        let Some(bytes) = self.db.get(identity.as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("Ignoring unreadable execution state for {}: {}", identity, e);
                Ok(None)
            }
        }
    }

    /// Overwrite the record for `state.identity`
    pub fn put(&self, state: &TaskExecutionState) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| CacheError::state(format!("encode state for {}: {e}", state.identity)))?;
        self.db.put(state.identity.as_bytes(), bytes)?;
        Ok(())
    }

    /// Returns whether a record existed
    pub fn remove(&self, identity: &str) -> Result<bool> {
        let existed = self.db.get_pinned(identity.as_bytes())?.is_some();
        if existed {
            self.db.delete(identity.as_bytes())?;
        }
        Ok(existed)
    }

    /// All decodable records in identity order
    pub fn list(&self) -> Result<Vec<TaskExecutionState>> {
        let mut states = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            match serde_json::from_slice::<TaskExecutionState>(&value) {
                Ok(state) => states.push(state),
                Err(e) => warn!(
                    "Ignoring unreadable execution state for {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(states)
    }

    /// Drop every record
    pub fn clear(&self) -> Result<usize> {
        let mut batch = rocksdb::WriteBatch::default();
        let mut count = 0;
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete(key);
            count += 1;
        }
        self.db.write(batch)?;
        Ok(count)
    }
}
