//! CLI module for fleetplane
//!
//! Subcommands:
//! - `fleetplane check` - Validate a settings file and list its group seeds
//! - `fleetplane serve` - Run the registry until interrupted

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "fleetplane")]
#[command(about = "Manage container runtime nodes as named groups")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file loaded before settings are read
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a settings file without starting anything
    Check(CheckArgs),

    /// Run the registry with the groups from the settings file
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Settings file (default: ~/.fleetplane/settings.yaml)
    pub settings: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Settings file (default: ~/.fleetplane/settings.yaml)
    #[arg(long, value_name = "FILE", env = "FLEETPLANE_SETTINGS")]
    pub settings: Option<String>,

    /// Override the number of node event workers
    #[arg(long)]
    pub workers: Option<usize>,
}
