/// `cachet serve` command implementation
///
/// Serves the local cache directory to other machines over HTTP, with
/// background eviction running alongside.
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::cli::ServeArgs;
use crate::cli_utils::load_config;
use crate::eviction::{spawn_background_eviction, BackgroundEvictionConfig};
use crate::http::CacheServer;
use crate::storage::{FilesystemStorage, Storage};

pub async fn run(args: &ServeArgs) -> Result<()> {
    let config = load_config(&args.common)?;
    config.validate()?;

    let dir = config.local_dir();
    let storage = Arc::new(
        FilesystemStorage::new(&dir)
            .with_context(|| format!("Failed to open local cache at {}", dir.display()))?,
    );
    let eviction = spawn_background_eviction(
        Arc::clone(&storage),
        BackgroundEvictionConfig::from_eviction_config(config.eviction_config()?)
            .with_check_interval(config.eviction_interval()?),
    );

    let shared: Arc<dyn Storage> = storage.clone();
    let server = CacheServer::new(args.bind, shared);

    let served = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    eviction.shutdown().await;
    storage.close();
    served
}
