//! Fingerprint engine
//!
//! Computes canonical, content-derived digests for sets of input files and
//! snapshots of declared outputs.
//!
//! ## Canonical form
//!
//! Every regular file reachable from the collection's roots is hashed
//! (SHA-256). Each file contributes a normalized path key chosen by
//! [`PathSensitivity`] plus its content digest. Entries are sorted by
//! (key, digest) before being folded into the combined digest, so directory
//! traversal order never leaks into the result:
//!
//! ```text
//! combined = SHA256("cachet-fingerprint-v1" | mode | count | (len key digest)*)
//! ```

mod changes;
mod hasher;

pub use changes::InputChanges;
pub use hasher::{hash_file_content, FileHasher};

use glob::glob;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::key::{sensitivity_tag, update_len_prefixed, ContentHash};

const FINGERPRINT_VERSION: &[u8] = b"cachet-fingerprint-v1";

/// How a file's path contributes to its fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathSensitivity {
    /// Full absolute path
    Absolute,
    /// Path relative to the unit's base directory
    #[default]
    Relative,
    /// File name only
    NameOnly,
    /// Path ignored, content only
    None,
}

impl PathSensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::Relative => "relative",
            Self::NameOnly => "name-only",
            Self::None => "none",
        }
    }
}

impl fmt::Display for PathSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathSensitivity {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "absolute" => Ok(Self::Absolute),
            "relative" => Ok(Self::Relative),
            "name-only" | "name_only" | "nameonly" => Ok(Self::NameOnly),
            "none" => Ok(Self::None),
            other => Err(CacheError::configuration(format!(
                "unknown path sensitivity '{other}' (expected absolute, relative, name-only or none)"
            ))),
        }
    }
}

/// Ordered set of input roots, resolved against a base directory
///
/// Roots are explicit paths (files or directories, which must exist) or glob
/// patterns (which may match nothing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCollection {
    base_dir: PathBuf,
    roots: Vec<Root>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Root {
    Path(PathBuf),
    Glob(String),
}

impl FileCollection {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            roots: Vec::new(),
        }
    }

    /// Add a file or directory root
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.roots.push(Root::Path(path.into()));
        self
    }

    /// Add a glob pattern root
    pub fn with_glob(mut self, pattern: impl Into<String>) -> Self {
        self.roots.push(Root::Glob(pattern.into()));
        self
    }

    /// Add a root, treating anything with glob metacharacters as a pattern
    pub fn with_spec(self, spec: &str) -> Self {
        if spec.contains(['*', '?', '[']) {
            self.with_glob(spec)
        } else {
            self.with_path(spec)
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Resolve every root to the regular files it contains
    ///
    /// Returns (absolute file path, directory root it was found under) pairs,
    /// deduplicated by path. A file reachable through several roots keeps the
    /// smallest directory root, whatever order the roots were declared in.
    fn resolve(&self) -> Result<BTreeMap<PathBuf, Option<PathBuf>>> {
        let mut files = BTreeMap::new();

        for root in &self.roots {
            match root {
                Root::Path(path) => {
                    let absolute = self.absolute(path);
                    let metadata = std::fs::metadata(&absolute)
                        .map_err(|e| CacheError::io(e, &absolute, "resolve input"))?;
                    if metadata.is_dir() {
                        for file in walk_files(&absolute)? {
                            claim(&mut files, file, Some(&absolute));
                        }
                    } else {
                        claim(&mut files, absolute, None);
                    }
                }
                Root::Glob(pattern) => {
                    for file in expand_glob(pattern, &self.base_dir)? {
                        claim(&mut files, file, None);
                    }
                }
            }
        }

        Ok(files)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

fn claim(files: &mut BTreeMap<PathBuf, Option<PathBuf>>, file: PathBuf, dir_root: Option<&Path>) {
    let current = files.entry(file).or_insert(None);
    if let Some(root) = dir_root {
        let replace = match current {
            Some(existing) => root < existing.as_path(),
            None => true,
        };
        if replace {
            *current = Some(root.to_path_buf());
        }
    }
}

/// One hashed input file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintedFile {
    pub path: PathBuf,
    pub normalized: String,
    pub hash: ContentHash,
}

/// Canonical digest over a set of input files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFingerprint {
    sensitivity: PathSensitivity,
    files: Vec<FingerprintedFile>,
    combined: ContentHash,
}

impl InputFingerprint {
    fn from_files(sensitivity: PathSensitivity, mut files: Vec<FingerprintedFile>) -> Self {
        files.sort_by(|a, b| {
            a.normalized
                .cmp(&b.normalized)
                .then_with(|| a.hash.cmp(&b.hash))
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION);
        hasher.update([sensitivity_tag(sensitivity)]);
        hasher.update((files.len() as u64).to_le_bytes());
        for file in &files {
            update_len_prefixed(&mut hasher, file.normalized.as_bytes());
            hasher.update(file.hash.as_bytes());
        }

        Self {
            sensitivity,
            files,
            combined: ContentHash::from_hasher(hasher),
        }
    }

    pub fn sensitivity(&self) -> PathSensitivity {
        self.sensitivity
    }

    /// Files in canonical order
    pub fn files(&self) -> &[FingerprintedFile] {
        &self.files
    }

    pub fn combined(&self) -> ContentHash {
        self.combined
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl PartialEq for InputFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.sensitivity == other.sensitivity && self.combined == other.combined
    }
}

impl Eq for InputFingerprint {}

/// State of one declared output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "hash", rename_all = "snake_case")]
pub enum OutputState {
    Missing,
    File(ContentHash),
    Directory(ContentHash),
}

impl OutputState {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Declared output path (relative to the base dir) to its state
pub type OutputSnapshot = BTreeMap<String, OutputState>;

/// Computes fingerprints, reusing file digests across calls
#[derive(Debug, Default)]
pub struct Fingerprinter {
    hasher: FileHasher,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hasher(&self) -> &FileHasher {
        &self.hasher
    }

    /// Fingerprint every file in `files` under the given path sensitivity
    ///
    /// Fails with `Io` when a root cannot be resolved or a file cannot be read,
    /// and with `Cancelled` as soon as `cancel` fires.
    pub fn fingerprint(
        &self,
        files: &FileCollection,
        sensitivity: PathSensitivity,
        cancel: &CancellationToken,
    ) -> Result<InputFingerprint> {
        let resolved = files.resolve()?;
        let mut entries = Vec::with_capacity(resolved.len());

        for (path, dir_root) in resolved {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let hash = self.hasher.hash(&path)?;
            let normalized = normalize(&path, dir_root.as_deref(), files.base_dir(), sensitivity);
            entries.push(FingerprintedFile {
                path,
                normalized,
                hash,
            });
        }

        Ok(InputFingerprint::from_files(sensitivity, entries))
    }

    /// Snapshot declared outputs; missing outputs are recorded, not errors
    pub fn snapshot_outputs(&self, base_dir: &Path, outputs: &[String]) -> Result<OutputSnapshot> {
        let mut snapshot = OutputSnapshot::new();

        for output in outputs {
            let path = base_dir.join(output);
            let state = match std::fs::metadata(&path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => OutputState::Missing,
                Err(e) => return Err(CacheError::io(e, &path, "stat output")),
                Ok(metadata) if metadata.is_dir() => {
                    let mut entries = Vec::new();
                    for file in walk_files(&path)? {
                        let hash = self.hasher.hash(&file)?;
                        let normalized = relative_key(&file, &path).unwrap_or_default();
                        entries.push(FingerprintedFile {
                            path: file,
                            normalized,
                            hash,
                        });
                    }
                    OutputState::Directory(
                        InputFingerprint::from_files(PathSensitivity::Relative, entries).combined(),
                    )
                }
                Ok(_) => OutputState::File(self.hasher.hash(&path)?),
            };
            snapshot.insert(output.clone(), state);
        }

        Ok(snapshot)
    }
}

fn normalize(
    path: &Path,
    dir_root: Option<&Path>,
    base_dir: &Path,
    sensitivity: PathSensitivity,
) -> String {
    match sensitivity {
        PathSensitivity::Absolute => slash_path(path),
        PathSensitivity::Relative => relative_key(path, base_dir)
            .or_else(|| {
                dir_root.and_then(|root| {
                    let name = root.file_name()?.to_string_lossy().into_owned();
                    relative_key(path, root).map(|rel| format!("{name}/{rel}"))
                })
            })
            .unwrap_or_else(|| file_name(path)),
        PathSensitivity::NameOnly => file_name(path),
        PathSensitivity::None => String::new(),
    }
}

fn relative_key(path: &Path, base: &Path) -> Option<String> {
    path.strip_prefix(base).ok().map(slash_path)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Join normal components with `/` regardless of platform
fn slash_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push('/'),
            Component::Prefix(prefix) => out.push_str(&prefix.as_os_str().to_string_lossy()),
            Component::CurDir => {}
            other => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&other.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

/// Regular files under `dir`, sorted
fn walk_files(dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            CacheError::io(e.into(), path, "walk directory")
        })?;
        if entry.file_type().is_file() {
            files.insert(entry.into_path());
        }
    }
    Ok(files)
}

/// Expand glob pattern relative to base directory, files only, sorted
pub fn expand_glob(pattern: &str, base_dir: &Path) -> Result<Vec<PathBuf>> {
    let full_pattern = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        base_dir.join(pattern).to_string_lossy().to_string()
    };

    let mut paths = Vec::new();
    let entries = glob(&full_pattern).map_err(|e| {
        CacheError::configuration(format!("invalid glob pattern '{pattern}': {e}"))
    })?;
    for entry in entries {
        let path = entry.map_err(|e| {
            let path = e.path().to_path_buf();
            CacheError::io(e.into_error(), path, "expand glob")
        })?;
        if path.is_file() {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}
