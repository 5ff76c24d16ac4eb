use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::fingerprint::InputChanges;
use crate::key::CacheKey;
use crate::outputs::OriginMetadata;

/// Where a unit of work is in its evaluation
///
/// Every unit starts in `Unknown` and moves to exactly one decided state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkState {
    #[default]
    Unknown,
    UpToDate,
    CacheHit,
    MustExecute,
    Executed,
    Failed,
}

/// Final outcome reported for a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    UpToDate,
    CacheHit,
    Executed,
    Failed,
}

impl Outcome {
    /// Console label
    pub fn label(&self) -> &'static str {
        match self {
            Self::UpToDate => "UP-TO-DATE",
            Self::CacheHit => "FROM-CACHE",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
        }
    }

    /// True unless the work failed
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UpToDate => "UP_TO_DATE",
            Self::CacheHit => "CACHE_HIT",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
        })
    }
}

impl From<Outcome> for WorkState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::UpToDate => Self::UpToDate,
            Outcome::CacheHit => Self::CacheHit,
            Outcome::Executed => Self::Executed,
            Outcome::Failed => Self::Failed,
        }
    }
}

/// Result of evaluating one unit of work
#[derive(Debug)]
pub struct WorkResult {
    pub identity: String,
    pub outcome: Outcome,
    /// Present for effectively cacheable units
    pub cache_key: Option<CacheKey>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Changes handed to the work; None when it did not run
    pub changes: Option<InputChanges>,
    /// Error returned by the work, verbatim
    pub failure: Option<anyhow::Error>,
    /// Origin of restored outputs on a cache hit
    pub origin: Option<OriginMetadata>,
}

impl WorkResult {
    pub fn state(&self) -> WorkState {
        self.outcome.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_start_unknown() {
        assert_eq!(WorkState::default(), WorkState::Unknown);
    }

    #[test]
    fn test_outcomes_map_to_decided_states() {
        for outcome in [
            Outcome::UpToDate,
            Outcome::CacheHit,
            Outcome::Executed,
            Outcome::Failed,
        ] {
            assert_ne!(WorkState::from(outcome), WorkState::Unknown);
        }
        assert_eq!(WorkState::from(Outcome::CacheHit), WorkState::CacheHit);
    }
}
