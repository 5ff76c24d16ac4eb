//! Content hashes and cache keys
//!
//! Both are 32-byte SHA-256 digests. `ContentHash` identifies file contents and
//! fingerprints; `CacheKey` addresses an entry in a build cache service.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CacheError, Result};
use crate::fingerprint::{InputFingerprint, PathSensitivity};

/// Bumped whenever the key derivation or payload format changes
const CACHE_KEY_VERSION: &[u8] = b"cachet-cache-key-v1";

/// SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a byte slice
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Finish a running hasher
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// Parse 64 hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != Self::LEN * 2 {
            return Err(CacheError::configuration(format!(
                "hash must be {} hex characters, got {}",
                Self::LEN * 2,
                hex_str.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| CacheError::configuration(format!("invalid hash '{hex_str}': {e}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Key addressing an entry in a build cache
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(ContentHash);

impl CacheKey {
    pub fn from_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        ContentHash::from_hex(hex_str).map(Self)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Derive the cache key of a unit of work
    ///
    /// Covers the implementation, the input fingerprint and the declared output
    /// paths. The unit identity is not part of the key; two units doing the same
    /// work over the same inputs share entries.
    pub fn derive(
        implementation: &str,
        inputs: &InputFingerprint,
        output_paths: &[String],
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(CACHE_KEY_VERSION);
        update_len_prefixed(&mut hasher, implementation.as_bytes());
        hasher.update([sensitivity_tag(inputs.sensitivity())]);
        hasher.update(inputs.combined().as_bytes());
        hasher.update((output_paths.len() as u64).to_le_bytes());
        for path in output_paths {
            update_len_prefixed(&mut hasher, path.as_bytes());
        }
        Self(ContentHash::from_hasher(hasher))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

pub(crate) fn update_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

pub(crate) fn sensitivity_tag(sensitivity: PathSensitivity) -> u8 {
    match sensitivity {
        PathSensitivity::Absolute => 0,
        PathSensitivity::Relative => 1,
        PathSensitivity::NameOnly => 2,
        PathSensitivity::None => 3,
    }
}
