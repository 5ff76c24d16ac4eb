// Library interface for Cachet
// The binary and integration tests use the engine through these modules

pub mod cli;
pub mod cli_utils;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod fingerprint;
pub mod http;
pub mod key;
pub mod logging;
pub mod outputs;
pub mod service;
pub mod state;
pub mod storage;

// Re-export commonly used types
pub use config::CacheConfig;
pub use engine::{IncrementalEngine, Outcome, UnitOfWork, WorkResult};
pub use error::{CacheError, Result};
pub use key::{CacheKey, ContentHash};
pub use service::{BuildCacheService, CacheSession};
pub use storage::{FilesystemStorage, Storage};
