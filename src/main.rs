use anyhow::Result;
use clap::Parser;

use cachet::cli::{Cli, Commands};
use cachet::{commands, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize structured logging
    logging::init(if cli.verbose { "debug" } else { "info" });

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Run(args) => commands::run::run(&args).await,
        Commands::Cache(args) => commands::cache::run(&args),
        Commands::State(args) => commands::state::run(&args),
        Commands::Serve(args) => commands::serve::run(&args).await,
        Commands::Config(args) => commands::config::run(args.command),
    }
}
