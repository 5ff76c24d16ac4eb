/// `cachet state` command implementation
use anyhow::{Context, Result};

use crate::cli::{StateArgs, StateCommands};
use crate::cli_utils::{cachet_prefix, load_config};
use crate::state::TaskStateStore;

pub fn run(args: &StateArgs) -> Result<()> {
    let config = load_config(&args.common)?;
    let store = TaskStateStore::open(config.state_dir())
        .with_context(|| format!("Failed to open state store at {}", config.state_dir().display()))?;

    match &args.command {
        StateCommands::Show { id } => show(&store, id),
        StateCommands::Forget { id } => forget(&store, id),
        StateCommands::List => list(&store),
    }
}

fn show(store: &TaskStateStore, id: &str) -> Result<()> {
    let Some(state) = store.get(id)? else {
        anyhow::bail!("No recorded state for {}", id);
    };
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn forget(store: &TaskStateStore, id: &str) -> Result<()> {
    if store.remove(id)? {
        eprintln!("{} Forgot {}", cachet_prefix(), id);
    } else {
        eprintln!("{} No recorded state for {}", cachet_prefix(), id);
    }
    Ok(())
}

fn list(store: &TaskStateStore) -> Result<()> {
    let states = store.list()?;
    if states.is_empty() {
        println!("No recorded units");
        return Ok(());
    }

    for state in states {
        println!(
            "{}  {}  {} inputs, {} outputs  {}",
            state.identity,
            state.origin,
            state.inputs.len(),
            state.outputs.len(),
            state.recorded_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
