/// Input change detection between two fingerprints
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::InputFingerprint;

/// Files that changed since the last recorded execution
///
/// When `incremental` is false there is no usable previous state and every
/// current input is reported as added; the work must treat it as a full
/// rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChanges {
    pub incremental: bool,
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl InputChanges {
    /// Everything is new
    pub fn non_incremental(current: &InputFingerprint) -> Self {
        Self {
            incremental: false,
            added: current.files().iter().map(|f| f.path.clone()).collect(),
            modified: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Compare files by absolute path
    pub fn between(previous: &InputFingerprint, current: &InputFingerprint) -> Self {
        let before: BTreeMap<_, _> = previous
            .files()
            .iter()
            .map(|f| (&f.path, f.hash))
            .collect();
        let after: BTreeMap<_, _> = current.files().iter().map(|f| (&f.path, f.hash)).collect();

        let mut changes = Self {
            incremental: true,
            ..Default::default()
        };

        for (path, hash) in &after {
            match before.get(path) {
                None => changes.added.push((*path).clone()),
                Some(old) if old != hash => changes.modified.push((*path).clone()),
                Some(_) => {}
            }
        }
        for path in before.keys() {
            if !after.contains_key(path) {
                changes.removed.push((*path).clone());
            }
        }

        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}
