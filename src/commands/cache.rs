/// `cachet cache` command implementation
///
/// Local build cache maintenance (stats, clean, evict).
use anyhow::{Context, Result};

use crate::cli::{CacheArgs, CacheCommands};
use crate::cli_utils::{cachet_prefix, format_bytes, load_config};
use crate::config::CacheConfig;
use crate::eviction::EvictionManager;
use crate::storage::{FilesystemStorage, Storage};

pub fn run(args: &CacheArgs) -> Result<()> {
    let config = load_config(&args.common)?;
    let storage = FilesystemStorage::new(config.local_dir())
        .with_context(|| format!("Failed to open local cache at {}", config.local_dir().display()))?;

    let result = match args.command {
        CacheCommands::Stats => stats(&storage, &config),
        CacheCommands::Clean => clean(&storage),
        CacheCommands::Evict => evict(&storage, &config),
    };
    storage.close();
    result
}

fn stats(storage: &FilesystemStorage, config: &CacheConfig) -> Result<()> {
    let stats = storage.stats().context("Failed to read cache statistics")?;

    println!("Cache directory: {}", stats.cache_dir.display());
    println!("Entries: {}", stats.total_objects);
    println!("Total size: {}", format_bytes(stats.total_bytes));
    println!("Max size: {}", config.local.max_size);
    println!("Retention: {}", config.local.retention);

    Ok(())
}

fn clean(storage: &FilesystemStorage) -> Result<()> {
    let before = storage.stats().context("Failed to read cache statistics")?;
    storage.clear().context("Failed to clear local cache")?;

    eprintln!(
        "{} Removed {} entries ({})",
        cachet_prefix(),
        before.total_objects,
        format_bytes(before.total_bytes)
    );
    Ok(())
}

fn evict(storage: &FilesystemStorage, config: &CacheConfig) -> Result<()> {
    let manager = EvictionManager::new(config.eviction_config()?);
    let report = manager.run_cycle(storage).context("Eviction failed")?;

    eprintln!(
        "{} Evicted {} entries ({} expired, {} over size), freed {}, {} remaining",
        cachet_prefix(),
        report.removed(),
        report.expired,
        report.evicted,
        format_bytes(report.bytes_freed),
        format_bytes(report.remaining_bytes)
    );
    Ok(())
}
