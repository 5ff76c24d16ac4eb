use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::cli::ConfigCommands;
use crate::config::{discover_config, CacheConfig};
use crate::service::factory::{self, RemoteRegistry};

pub fn run(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Example => {
            println!("{}", CacheConfig::example());
            Ok(())
        }
        ConfigCommands::Validate { path } => match path {
            Some(path) => validate(&path),
            None => {
                let cwd = std::env::current_dir().context("Failed to read working directory")?;
                let path = discover_config(&cwd)
                    .with_context(|| format!("No cachet.toml found in {} or its parents", cwd.display()))?;
                validate(&path)
            }
        },
    }
}

fn validate(path: &Path) -> Result<()> {
    info!("Validating config file: {}", path.display());

    let config = CacheConfig::from_file(path)?;
    factory::validate(&config, &RemoteRegistry::default())?;

    println!("✓ Configuration file is valid: {}", path.display());
    println!("\nSummary:");
    if config.local.enabled {
        println!("  - Local cache: {}", config.local_dir().display());
        println!("  - Max size: {}", config.local.max_size);
        println!("  - Retention: {}", config.local.retention);
    } else {
        println!("  - Local cache: disabled");
    }
    if config.remote.enabled {
        println!(
            "  - Remote cache: {} {} (push: {}, timeout: {})",
            config.remote.kind,
            config.remote.url.as_deref().unwrap_or_default(),
            config.remote.push,
            config.remote.timeout
        );
    } else {
        println!("  - Remote cache: disabled");
    }
    println!("  - State directory: {}", config.state_dir().display());

    Ok(())
}
