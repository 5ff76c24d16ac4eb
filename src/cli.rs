use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::fingerprint::PathSensitivity;

/// Cachet - Incremental build cache
///
/// Skips work whose inputs and outputs are unchanged, and restores outputs
/// from a local or remote build cache when another run already produced them.
#[derive(Parser, Debug)]
#[command(name = "cachet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental build cache and up-to-date checks", long_about = None)]
pub struct Cli {
    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Configuration arguments shared across commands
#[derive(Args, Debug, Clone, Default)]
pub struct CommonConfigArgs {
    /// Config file path (default: discover cachet.toml upward)
    #[arg(short = 'c', long, env = "CACHET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command as a cached unit of work
    Run(RunArgs),

    /// Manage the local build cache
    Cache(CacheArgs),

    /// Inspect recorded execution state
    State(StateArgs),

    /// Serve the local build cache over HTTP
    Serve(ServeArgs),

    /// Configuration management utilities
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Unit identity, stable across builds (e.g. ":app:compile")
    #[arg(long)]
    pub id: String,

    /// Input file, directory or glob, relative to the working directory
    #[arg(short, long = "input")]
    pub inputs: Vec<String>,

    /// Declared output file or directory, relative to the working directory
    #[arg(short, long = "output")]
    pub outputs: Vec<String>,

    /// How input paths contribute to the fingerprint
    #[arg(long, default_value = "relative", value_parser = parse_sensitivity)]
    pub path_sensitivity: PathSensitivity,

    /// Do not load from or store to the build cache
    #[arg(long)]
    pub no_cache: bool,

    #[command(flatten)]
    pub common: CommonConfigArgs,

    /// Command to execute (after --)
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

fn parse_sensitivity(value: &str) -> Result<PathSensitivity, String> {
    value.parse().map_err(|e: crate::error::CacheError| e.to_string())
}

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show local cache statistics
    Stats,

    /// Remove every local cache entry
    Clean,

    /// Run one eviction cycle now
    Evict,
}

#[derive(Args, Debug)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateCommands,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the recorded state of a unit
    Show {
        /// Unit identity
        id: String,
    },

    /// Forget a unit so it runs again
    Forget {
        /// Unit identity
        id: String,
    },

    /// List all units with recorded state
    List,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7070", env = "CACHET_BIND")]
    pub bind: SocketAddr,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print an example configuration file
    Example,

    /// Validate a configuration file (default: the discovered one)
    Validate {
        /// Path to config file
        path: Option<PathBuf>,
    },
}
