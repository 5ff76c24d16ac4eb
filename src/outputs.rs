/// Output packing and restoration
///
/// A cache payload is a zstd-compressed tar archive. Its first entry is
/// `.cachet/origin.json` describing where and when the outputs were produced;
/// the declared outputs follow, stored relative to the unit's base directory.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path};
use std::time::Duration;
use tar::{Archive, Builder, Header};
use zstd::{decode_all, encode_all};

use crate::error::{CacheError, Result};
use crate::key::CacheKey;

/// Archive path of the origin metadata
pub const ORIGIN_PATH: &str = ".cachet/origin.json";

const ZSTD_LEVEL: i32 = 3;

/// Kind of a packed output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackedKind {
    File,
    Directory,
    /// Declared but not produced; restoring leaves it absent
    Missing,
}

/// Manifest line for one declared output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedOutput {
    pub path: String,
    pub kind: PackedKind,
    pub size_bytes: u64,
    pub file_count: usize,
}

/// Origin metadata stored alongside the outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginMetadata {
    pub identity: String,
    pub cache_key: CacheKey,
    pub build_host: String,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub outputs: Vec<PackedOutput>,
}

impl OriginMetadata {
    pub fn new(identity: impl Into<String>, cache_key: CacheKey, execution_time: Duration) -> Self {
        let build_host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            identity: identity.into(),
            cache_key,
            build_host,
            created_at: Utc::now(),
            execution_time_ms: execution_time.as_millis() as u64,
            outputs: Vec::new(),
        }
    }
}

/// Pack declared outputs into a cache payload
pub fn pack_outputs(base_dir: &Path, outputs: &[String], mut origin: OriginMetadata) -> Result<Vec<u8>> {
    origin.outputs = outputs
        .iter()
        .map(|output| describe_output(base_dir, output))
        .collect::<Result<_>>()?;

    let metadata = serde_json::to_vec_pretty(&origin)
        .map_err(|e| CacheError::io(e.into(), base_dir, "encode origin metadata"))?;

    let mut tar_data = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_data);
        tar.follow_symlinks(true);

        let mut header = Header::new_gnu();
        header.set_size(metadata.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(origin.created_at.timestamp().max(0) as u64);
        header.set_cksum();
        tar.append_data(&mut header, ORIGIN_PATH, metadata.as_slice())
            .map_err(|e| CacheError::io(e, base_dir, "archive origin metadata"))?;

        for packed in &origin.outputs {
            let output_path = base_dir.join(&packed.path);
            let result = match packed.kind {
                PackedKind::Directory => tar.append_dir_all(&packed.path, &output_path),
                PackedKind::File => File::open(&output_path)
                    .and_then(|mut file| tar.append_file(&packed.path, &mut file)),
                PackedKind::Missing => Ok(()),
            };
            result.map_err(|e| CacheError::io(e, &output_path, "archive output"))?;
        }

        tar.finish()
            .map_err(|e| CacheError::io(e, base_dir, "finalize archive"))?;
    }

    encode_all(tar_data.as_slice(), ZSTD_LEVEL)
        .map_err(|e| CacheError::io(e, base_dir, "compress archive"))
}

/// Restore a payload's outputs into `base_dir`
///
/// The whole archive is validated before anything on disk changes: it must
/// start with origin metadata for `key`, and every entry must lie inside one of
/// the declared `outputs`. Any violation is a `CorruptEntry`. Declared outputs
/// are removed before unpacking so no stale files survive.
pub fn unpack_outputs(
    payload: &[u8],
    key: &CacheKey,
    base_dir: &Path,
    outputs: &[String],
) -> Result<OriginMetadata> {
    let tar_data =
        decode_all(payload).map_err(|e| CacheError::corrupt(key, format!("zstd: {e}")))?;
    let origin = validate_archive(&tar_data, key, outputs)?;

    remove_outputs(base_dir, outputs)?;

    let mut archive = Archive::new(tar_data.as_slice());
    let entries = archive
        .entries()
        .map_err(|e| CacheError::corrupt(key, format!("tar: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CacheError::corrupt(key, format!("tar: {e}")))?;
        let is_origin = entry
            .path()
            .map(|p| p.as_ref() == Path::new(ORIGIN_PATH))
            .unwrap_or(false);
        if is_origin {
            continue;
        }
        // Restored files look freshly written to the file hasher
        entry.set_preserve_mtime(false);
        entry
            .unpack_in(base_dir)
            .map_err(|e| CacheError::io(e, base_dir, "extract output"))?;
    }

    Ok(origin)
}

/// Delete declared outputs (files or directories) under `base_dir`
pub fn remove_outputs(base_dir: &Path, outputs: &[String]) -> Result<()> {
    for output in outputs {
        let path = base_dir.join(output);
        let result = match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => Err(e),
        };
        result.map_err(|e| CacheError::io(e, &path, "remove stale output"))?;
    }
    Ok(())
}

/// Read origin metadata from a payload without touching the file system
pub fn read_origin(payload: &[u8], key: &CacheKey) -> Result<OriginMetadata> {
    let tar_data =
        decode_all(payload).map_err(|e| CacheError::corrupt(key, format!("zstd: {e}")))?;
    let mut archive = Archive::new(tar_data.as_slice());
    let mut entries = archive
        .entries()
        .map_err(|e| CacheError::corrupt(key, format!("tar: {e}")))?;
    let first = entries
        .next()
        .ok_or_else(|| CacheError::corrupt(key, "empty archive"))?
        .map_err(|e| CacheError::corrupt(key, format!("tar: {e}")))?;
    parse_origin(first, key)
}

fn validate_archive(tar_data: &[u8], key: &CacheKey, outputs: &[String]) -> Result<OriginMetadata> {
    let mut archive = Archive::new(tar_data);
    let mut entries = archive
        .entries()
        .map_err(|e| CacheError::corrupt(key, format!("tar: {e}")))?;

    let first = entries
        .next()
        .ok_or_else(|| CacheError::corrupt(key, "empty archive"))?
        .map_err(|e| CacheError::corrupt(key, format!("tar: {e}")))?;
    let origin = parse_origin(first, key)?;

    for entry in entries {
        let mut entry = entry.map_err(|e| CacheError::corrupt(key, format!("tar: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| CacheError::corrupt(key, format!("entry path: {e}")))?
            .into_owned();

        let safe = path.components().all(|c| matches!(c, Component::Normal(_)));
        let declared = outputs.iter().any(|output| path.starts_with(output));
        if !safe || !declared {
            return Err(CacheError::corrupt(
                key,
                format!("undeclared path in archive: {}", path.display()),
            ));
        }

        // Forces the body through the reader so truncation shows up here
        std::io::copy(&mut entry, &mut std::io::sink())
            .map_err(|e| CacheError::corrupt(key, format!("entry body: {e}")))?;
    }

    Ok(origin)
}

fn parse_origin<R: Read>(mut entry: tar::Entry<'_, R>, key: &CacheKey) -> Result<OriginMetadata> {
    let is_origin = entry
        .path()
        .map(|p| p.as_ref() == Path::new(ORIGIN_PATH))
        .unwrap_or(false);
    if !is_origin {
        return Err(CacheError::corrupt(key, "missing origin metadata"));
    }

    let mut json = Vec::new();
    entry
        .read_to_end(&mut json)
        .map_err(|e| CacheError::corrupt(key, format!("origin metadata: {e}")))?;
    let origin: OriginMetadata = serde_json::from_slice(&json)
        .map_err(|e| CacheError::corrupt(key, format!("origin metadata: {e}")))?;

    if origin.cache_key != *key {
        return Err(CacheError::corrupt(
            key,
            format!("payload belongs to key {}", origin.cache_key),
        ));
    }
    Ok(origin)
}

fn describe_output(base_dir: &Path, output: &str) -> Result<PackedOutput> {
    let path = base_dir.join(output);
    let (kind, size_bytes, file_count) = match fs::metadata(&path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (PackedKind::Missing, 0, 0),
        Err(e) => return Err(CacheError::io(e, &path, "stat output")),
        Ok(metadata) if metadata.is_dir() => {
            let (size, count) = get_dir_size_and_count(&path)?;
            (PackedKind::Directory, size, count)
        }
        Ok(metadata) => (PackedKind::File, metadata.len(), 1),
    };

    Ok(PackedOutput {
        path: output.to_string(),
        kind,
        size_bytes,
        file_count,
    })
}

/// Get total size and file count of a directory
fn get_dir_size_and_count(path: &Path) -> Result<(u64, usize)> {
    let mut total_size = 0;
    let mut file_count = 0;

    for entry in walkdir::WalkDir::new(path).follow_links(true) {
        let entry = entry.map_err(|e| {
            let at = e.path().unwrap_or(path).to_path_buf();
            CacheError::io(e.into(), at, "walk output directory")
        })?;
        if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .map_err(|e| CacheError::io(e.into(), entry.path(), "stat output file"))?;
            total_size += metadata.len();
            file_count += 1;
        }
    }

    Ok((total_size, file_count))
}
