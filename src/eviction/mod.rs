//! Cache eviction module
//!
//! Keeps the local entry store bounded:
//! - **Retention**: removes entries that have not been loaded or stored within
//!   the retention period
//! - **LRU** (Least Recently Used): when the store is still over `max_size`,
//!   removes the least recently accessed entries until it is at 90% of it
//!
//! ## Architecture
//!
//! Eviction runs asynchronously in a background task:
//! - Periodically checks the store (default: every 30 seconds)
//! - Can be triggered manually (`cachet cache evict`)
//! - Non-blocking: `load`/`store` are never delayed by eviction
//!
//! ## Configuration
//!
//! ```toml
//! [local]
//! max_size = "5GB"
//! retention = "7d"
//! eviction_interval = "30s"
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

mod background;
mod policy;

pub use background::{
    spawn_background_eviction, BackgroundEvictionConfig, BackgroundEvictionHandle,
    EvictableStorage,
};
pub use policy::{EvictionCandidate, EvictionPolicy, LruPolicy, RetentionPolicy};

/// Eviction statistics
#[derive(Debug, Default)]
pub struct EvictionStats {
    /// Total number of evictions performed
    pub evictions_total: AtomicU64,
    /// Total bytes evicted
    pub bytes_evicted: AtomicU64,
    /// Number of eviction runs
    pub eviction_runs: AtomicU64,
}

impl EvictionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.evictions_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_run(&self) {
        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_evictions_total(&self) -> u64 {
        self.evictions_total.load(Ordering::Relaxed)
    }

    pub fn get_bytes_evicted(&self) -> u64 {
        self.bytes_evicted.load(Ordering::Relaxed)
    }

    pub fn get_eviction_runs(&self) -> u64 {
        self.eviction_runs.load(Ordering::Relaxed)
    }
}

/// Eviction manager configuration
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Maximum store size in bytes
    pub max_size_bytes: u64,
    /// Entries not accessed for this long are removed regardless of size
    pub retention_secs: u64,
    /// Target size after eviction (percentage of max_size)
    /// Default: 0.9 (evict until 90% of max_size)
    pub target_ratio: f64,
    /// Maximum entries to evict per run
    pub max_evictions_per_run: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            retention_secs: 7 * 24 * 60 * 60,      // 7 days
            target_ratio: 0.9,
            max_evictions_per_run: 1000,
        }
    }
}

impl EvictionConfig {
    /// Parse a size string (e.g., "5GB", "100MB", "1TB") into bytes
    pub fn parse_size(size_str: &str) -> Result<u64> {
        let normalized = size_str.trim().to_uppercase();

        let (num, multiplier) = if let Some(num) = normalized.strip_suffix("TB") {
            (num, 1024u64 * 1024 * 1024 * 1024)
        } else if let Some(num) = normalized.strip_suffix("GB") {
            (num, 1024 * 1024 * 1024)
        } else if let Some(num) = normalized.strip_suffix("MB") {
            (num, 1024 * 1024)
        } else if let Some(num) = normalized.strip_suffix("KB") {
            (num, 1024)
        } else if let Some(num) = normalized.strip_suffix('B') {
            (num, 1)
        } else {
            // Assume bytes
            (normalized.as_str(), 1)
        };

        num.trim()
            .parse::<u64>()
            .ok()
            .and_then(|n| n.checked_mul(multiplier))
            .ok_or_else(|| CacheError::configuration(format!("invalid size '{size_str}'")))
    }

    /// Parse a duration string (e.g., "7d", "24h", "30m", "10s") into seconds
    pub fn parse_duration(duration_str: &str) -> Result<u64> {
        let normalized = duration_str.trim().to_lowercase();

        let (num, multiplier) = if let Some(num) = normalized.strip_suffix('d') {
            (num, 24 * 60 * 60)
        } else if let Some(num) = normalized.strip_suffix('h') {
            (num, 60 * 60)
        } else if let Some(num) = normalized.strip_suffix('m') {
            (num, 60)
        } else if let Some(num) = normalized.strip_suffix('s') {
            (num, 1)
        } else {
            // Assume seconds
            (normalized.as_str(), 1u64)
        };

        num.trim()
            .parse::<u64>()
            .ok()
            .and_then(|n| n.checked_mul(multiplier))
            .ok_or_else(|| {
                CacheError::configuration(format!("invalid duration '{duration_str}'"))
            })
    }

    /// Create config from the `[local]` size and retention strings
    pub fn from_local_config(max_size: &str, retention: &str) -> Result<Self> {
        Ok(Self {
            max_size_bytes: Self::parse_size(max_size)?,
            retention_secs: Self::parse_duration(retention)?,
            ..Default::default()
        })
    }

    /// Get target size in bytes (after eviction)
    pub fn target_size_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.target_ratio) as u64
    }
}

/// Outcome of one eviction cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries removed because they outlived the retention period
    pub expired: usize,
    /// Entries removed to bring the store under its size bound
    pub evicted: usize,
    pub bytes_freed: u64,
    /// Store size after the cycle
    pub remaining_bytes: u64,
}

impl EvictionReport {
    pub fn removed(&self) -> usize {
        self.expired + self.evicted
    }
}

/// Eviction manager
///
/// Applies the retention policy first, then LRU down to the target size.
pub struct EvictionManager {
    config: EvictionConfig,
    stats: Arc<EvictionStats>,
}

impl EvictionManager {
    pub fn new(config: EvictionConfig) -> Self {
        debug!(
            "Eviction manager initialized: max_size={}MB, retention={}s, target_ratio={}",
            config.max_size_bytes / (1024 * 1024),
            config.retention_secs,
            config.target_ratio
        );

        Self {
            config,
            stats: Arc::new(EvictionStats::new()),
        }
    }

    /// Get eviction statistics
    pub fn stats(&self) -> Arc<EvictionStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Check if eviction is needed based on current store size
    pub fn needs_eviction(&self, current_size_bytes: u64) -> bool {
        current_size_bytes > self.config.max_size_bytes
    }

    /// Calculate how many bytes need to be evicted
    pub fn bytes_to_evict(&self, current_size_bytes: u64) -> u64 {
        current_size_bytes.saturating_sub(self.config.target_size_bytes())
    }

    /// Select least recently used candidates until `bytes_to_evict` is covered
    ///
    /// Returns candidates ordered by eviction priority, capped at
    /// `max_evictions_per_run`.
    pub fn select_candidates(
        &self,
        candidates: &[EvictionCandidate],
        bytes_to_evict: u64,
    ) -> Vec<EvictionCandidate> {
        let mut sorted_candidates = candidates.to_vec();
        LruPolicy.sort_candidates(&mut sorted_candidates);

        let mut selected = Vec::new();
        let mut total_size = 0u64;

        for candidate in sorted_candidates {
            if total_size >= bytes_to_evict {
                break;
            }
            if selected.len() >= self.config.max_evictions_per_run {
                break;
            }

            total_size += candidate.size;
            selected.push(candidate);
        }

        debug!(
            "Selected {} candidates for eviction ({} bytes)",
            selected.len(),
            total_size
        );

        selected
    }

    /// Run one retention + size cycle against a store
    pub fn run_cycle<S: EvictableStorage + ?Sized>(&self, storage: &S) -> Result<EvictionReport> {
        let start = Instant::now();
        let mut report = EvictionReport::default();

        let candidates = storage.get_eviction_candidates()?;

        let retention = RetentionPolicy::new(self.config.retention_secs, unix_now());
        let (mut expired, live): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|candidate| retention.is_expired(candidate));
        retention.sort_candidates(&mut expired);

        for candidate in expired.iter().take(self.config.max_evictions_per_run) {
            if self.evict(storage, candidate) {
                report.expired += 1;
                report.bytes_freed += candidate.size;
            }
        }

        let mut current_size: u64 = live.iter().map(|c| c.size).sum();
        if self.needs_eviction(current_size) {
            let bytes_to_evict = self.bytes_to_evict(current_size);
            info!(
                "Cache size {}MB exceeds limit {}MB, evicting {}MB",
                current_size / (1024 * 1024),
                self.config.max_size_bytes / (1024 * 1024),
                bytes_to_evict / (1024 * 1024)
            );

            for candidate in self.select_candidates(&live, bytes_to_evict) {
                if self.evict(storage, &candidate) {
                    report.evicted += 1;
                    report.bytes_freed += candidate.size;
                    current_size -= candidate.size;
                }
            }
        } else {
            debug!(
                "Cache size {}MB is under limit {}MB, no size eviction needed",
                current_size / (1024 * 1024),
                self.config.max_size_bytes / (1024 * 1024)
            );
        }

        report.remaining_bytes = current_size;
        self.stats.record_run();
        self.log_summary(&report, start.elapsed());

        Ok(report)
    }

    fn evict<S: EvictableStorage + ?Sized>(&self, storage: &S, candidate: &EvictionCandidate) -> bool {
        match storage.delete_object(&candidate.key) {
            Ok(()) => {
                self.stats.record_eviction(candidate.size);
                debug!("Evicted entry {} ({} bytes)", candidate.key, candidate.size);
                true
            }
            Err(e) => {
                warn!("Failed to evict entry {}: {}", candidate.key, e);
                false
            }
        }
    }

    fn log_summary(&self, report: &EvictionReport, elapsed: Duration) {
        if report.removed() > 0 {
            info!(
                "Eviction complete: removed {} entries ({} expired, {} over size, {} MB) in {}ms",
                report.removed(),
                report.expired,
                report.evicted,
                report.bytes_freed / (1024 * 1024),
                elapsed.as_millis()
            );
        } else {
            debug!("Eviction check complete: no entries removed");
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
