use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::eviction::EvictionConfig;

/// Configuration file name looked up by discovery
pub const CONFIG_FILE_NAME: &str = "cachet.toml";

/// Environment variable overriding `local.dir`
pub const CACHE_DIR_ENV: &str = "CACHET_CACHE_DIR";

/// Complete cache configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub local: LocalCacheConfig,

    #[serde(default)]
    pub remote: RemoteCacheConfig,

    #[serde(default)]
    pub state: StateConfig,

    /// Directory relative paths are resolved against (the config file's directory)
    #[serde(skip)]
    pub root: PathBuf,
}

/// Local cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory path
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Maximum cache size (e.g., "5GB", "100GB")
    #[serde(default = "default_max_size")]
    pub max_size: String,

    /// Entries unused for this long are removed
    #[serde(default = "default_retention")]
    pub retention: String,

    /// How often background eviction checks the store
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: String,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            max_size: default_max_size(),
            retention: default_retention(),
            eviction_interval: default_eviction_interval(),
        }
    }
}

/// Remote cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Remote type, resolved through the remote registry
    #[serde(rename = "type", default = "default_remote_type")]
    pub kind: String,

    pub url: Option<String>,

    /// Whether this build may write to the remote cache
    #[serde(default)]
    pub push: bool,

    #[serde(default = "default_remote_timeout")]
    pub timeout: String,

    /// HTTP basic auth
    pub username: Option<String>,
    pub password: Option<String>,

    /// Name of an environment variable holding a bearer token
    pub token_env: Option<String>,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: default_remote_type(),
            url: None,
            push: false,
            timeout: default_remote_timeout(),
            username: None,
            password: None,
            token_env: None,
        }
    }
}

impl RemoteCacheConfig {
    pub fn timeout(&self) -> Result<Duration> {
        EvictionConfig::parse_duration(&self.timeout).map(Duration::from_secs)
    }
}

/// Execution state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> String {
    ".cachet/cache".to_string()
}

fn default_max_size() -> String {
    "5GB".to_string()
}

fn default_retention() -> String {
    "7d".to_string()
}

fn default_eviction_interval() -> String {
    "30s".to_string()
}

fn default_remote_type() -> String {
    "http".to_string()
}

fn default_remote_timeout() -> String {
    "30s".to_string()
}

fn default_state_dir() -> String {
    ".cachet/state".to_string()
}

impl CacheConfig {
    /// Load configuration from TOML file
    ///
    /// Relative directories in the file resolve against the file's directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CacheError::io(e, path, "read config"))?;

        let mut config: CacheConfig = toml::from_str(&content).map_err(|e| {
            CacheError::configuration(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(config)
    }

    /// Load an explicit config file, or discover one upward from `start_dir`
    ///
    /// Falls back to defaults rooted at `start_dir` when nothing is found.
    pub fn load(explicit_path: Option<&Path>, start_dir: &Path) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => match discover_config(start_dir) {
                Some(path) => Self::from_file(path)?,
                None => Self {
                    root: start_dir.to_path_buf(),
                    ..Default::default()
                },
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `CACHET_CACHE_DIR`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.is_empty() {
                self.local.dir = dir;
            }
        }
    }

    fn resolve(&self, dir: &str) -> PathBuf {
        let path = Path::new(dir);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn local_dir(&self) -> PathBuf {
        self.resolve(&self.local.dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.state.dir)
    }

    pub fn eviction_config(&self) -> Result<EvictionConfig> {
        EvictionConfig::from_local_config(&self.local.max_size, &self.local.retention)
    }

    pub fn eviction_interval(&self) -> Result<Duration> {
        EvictionConfig::parse_duration(&self.local.eviction_interval).map(Duration::from_secs)
    }

    /// Generate example configuration as TOML string
    pub fn example() -> String {
        let config = CacheConfig {
            remote: RemoteCacheConfig {
                enabled: true,
                url: Some("https://cache.example.com/cache/".to_string()),
                push: false,
                token_env: Some("CACHET_REMOTE_TOKEN".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let body = toml::to_string_pretty(&config).unwrap_or_default();
        format!("# cachet configuration ({CONFIG_FILE_NAME})\n# Relative directories resolve against this file's directory.\n\n{body}")
    }

    /// Validate configuration
    ///
    /// Remote type lookup happens in the registry; everything else that can
    /// fail is checked here so errors surface before any work runs.
    pub fn validate(&self) -> Result<()> {
        if self.local.enabled {
            if self.local.dir.is_empty() {
                return Err(CacheError::configuration("local.dir must be set"));
            }
            self.eviction_config()?;
            self.eviction_interval()?;
        }

        if self.state.dir.is_empty() {
            return Err(CacheError::configuration("state.dir must be set"));
        }

        if self.remote.enabled {
            let url = self
                .remote
                .url
                .as_deref()
                .ok_or_else(|| CacheError::configuration("remote.url must be set when the remote cache is enabled"))?;

            let parsed = reqwest::Url::parse(url)
                .map_err(|e| CacheError::configuration(format!("invalid remote.url '{url}': {e}")))?;
            if !["http", "https"].contains(&parsed.scheme()) {
                return Err(CacheError::configuration(format!(
                    "remote.url must start with http:// or https://: {url}"
                )));
            }

            if self.remote.username.is_some() != self.remote.password.is_some() {
                return Err(CacheError::configuration(
                    "remote.username and remote.password must be set together",
                ));
            }

            self.remote.timeout()?;
        }

        Ok(())
    }
}

/// Find `cachet.toml` in `start_dir` or any of its ancestors
pub fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    start_dir
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}
