/// `cachet run` command implementation
///
/// Evaluates one unit of work whose action is an external command.
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::RunArgs;
use crate::cli_utils::{cachet_prefix, load_config};
use crate::engine::{IncrementalEngine, Outcome, UnitOfWork};
use crate::fingerprint::InputChanges;
use crate::service::CacheSession;
use crate::state::TaskStateStore;

/// Set to `true` or `false` for the executed command
pub const INCREMENTAL_ENV: &str = "CACHET_INCREMENTAL";

pub async fn run(args: &RunArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let config = load_config(&args.common)?;
    let unit = build_unit(args, &cwd)?;

    let session = CacheSession::open(&config)
        .await
        .context("Failed to open build cache")?;
    let states = TaskStateStore::open(config.state_dir())
        .with_context(|| format!("Failed to open state store at {}", config.state_dir().display()))?;
    let cancel = session.cancellation();
    let interrupt = cancel_on_interrupt(cancel.clone());
    let engine = IncrementalEngine::new(Arc::new(states), session.service(), cancel.clone());

    let command = args.command.clone();
    let workdir = cwd.clone();
    let evaluated = engine
        .evaluate(&unit, move |changes| async move {
            execute(&command, &workdir, &changes, &cancel).await
        })
        .await;

    interrupt.abort();
    drop(engine);
    session.close().await.context("Failed to close build cache")?;

    let result = evaluated.with_context(|| format!("Failed to evaluate {}", args.id))?;
    eprintln!(
        "{} {} {} ({:.2}s)",
        cachet_prefix(),
        result.identity,
        result.outcome.label(),
        result.duration.as_secs_f64()
    );

    match (result.outcome, result.failure) {
        (Outcome::Failed, Some(failure)) => Err(failure.context(format!("{} failed", args.id))),
        _ => Ok(()),
    }
}

fn build_unit(args: &RunArgs, cwd: &Path) -> Result<UnitOfWork> {
    // JSON keeps argument boundaries unambiguous
    let implementation = serde_json::to_string(&args.command).context("Failed to encode command")?;

    let mut unit = UnitOfWork::new(&args.id, format!("cmd:{implementation}"), cwd.to_path_buf())
        .with_sensitivity(args.path_sensitivity)
        .cacheable(!args.no_cache);
    for input in &args.inputs {
        unit = unit.with_input(input);
    }
    for output in &args.outputs {
        unit = unit.with_output(output.as_str());
    }
    Ok(unit)
}

/// Cancel the session when the user presses Ctrl+C
fn cancel_on_interrupt(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling build");
            cancel.cancel();
        }
    })
}

async fn execute(
    command: &[String],
    workdir: &Path,
    changes: &InputChanges,
    cancel: &CancellationToken,
) -> Result<()> {
    let (program, arguments) = command
        .split_first()
        .context("No command given")?;

    debug!(
        "Running {} ({} added, {} modified, {} removed, incremental: {})",
        program,
        changes.added.len(),
        changes.modified.len(),
        changes.removed.len(),
        changes.incremental
    );

    // Dropping the status future on cancellation kills the child
    let running = Command::new(program)
        .args(arguments)
        .current_dir(workdir)
        .env(INCREMENTAL_ENV, changes.incremental.to_string())
        .kill_on_drop(true)
        .status();

    let status = tokio::select! {
        status = running => status.with_context(|| format!("Failed to spawn {}", program))?,
        _ = cancel.cancelled() => anyhow::bail!("{} cancelled", program),
    };

    if !status.success() {
        anyhow::bail!("{} exited with {}", program, status);
    }
    Ok(())
}
