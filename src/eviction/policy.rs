//! Eviction policy implementations
//!
//! - **LRU**: Sort by `accessed_at` (oldest first)
//! - **Retention**: Only select entries not accessed within the retention period

use crate::key::CacheKey;

/// Candidate for eviction with all metadata needed for policy decisions
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    /// Entry size in bytes
    pub size: u64,
    /// Last access timestamp (Unix seconds)
    pub accessed_at: i64,
}

/// Trait for eviction policy implementations
pub trait EvictionPolicy: Send + Sync {
    /// Sort candidates by eviction priority (first = most likely to evict)
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]);

    /// Filter candidates that should be considered for eviction
    /// Default: consider all candidates
    fn filter_candidates(&self, candidates: &[EvictionCandidate]) -> Vec<EvictionCandidate> {
        candidates.to_vec()
    }
}

/// LRU (Least Recently Used) eviction policy
#[derive(Debug, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]) {
        // Oldest access first, key as a stable tie-breaker
        candidates.sort_by(|a, b| {
            a.accessed_at
                .cmp(&b.accessed_at)
                .then_with(|| a.key.cmp(&b.key))
        });
    }
}

/// Retention policy
///
/// Entries whose last access is older than the retention period are expired.
/// Entries inside the period are never selected by this policy.
#[derive(Debug)]
pub struct RetentionPolicy {
    retention_secs: u64,
    now: i64,
}

impl RetentionPolicy {
    pub fn new(retention_secs: u64, now: i64) -> Self {
        Self {
            retention_secs,
            now,
        }
    }

    pub fn is_expired(&self, candidate: &EvictionCandidate) -> bool {
        self.now - candidate.accessed_at > self.retention_secs as i64
    }
}

impl EvictionPolicy for RetentionPolicy {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]) {
        LruPolicy.sort_candidates(candidates);
    }

    fn filter_candidates(&self, candidates: &[EvictionCandidate]) -> Vec<EvictionCandidate> {
        candidates
            .iter()
            .filter(|c| self.is_expired(c))
            .cloned()
            .collect()
    }
}
