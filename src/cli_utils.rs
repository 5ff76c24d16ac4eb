/// CLI utilities for consistent output formatting
use anyhow::{Context, Result};
use std::io::IsTerminal;

use crate::cli::CommonConfigArgs;
use crate::config::CacheConfig;

/// Get a colored prefix
///
/// Returns bright cyan if stderr is a TTY, plain text otherwise.
pub fn cachet_prefix() -> &'static str {
    if std::io::stderr().is_terminal() {
        "\x1b[96m[cachet]\x1b[0m"
    } else {
        "[cachet]"
    }
}

/// Resolve configuration from `--config`, discovery and `--cache-dir`
pub fn load_config(common: &CommonConfigArgs) -> Result<CacheConfig> {
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let mut config = CacheConfig::load(common.config.as_deref(), &cwd)
        .context("Failed to load configuration")?;

    if let Some(dir) = &common.cache_dir {
        config.local.dir = cwd.join(dir).to_string_lossy().into_owned();
    }

    Ok(config)
}

/// `1536` -> `1.50 KB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
