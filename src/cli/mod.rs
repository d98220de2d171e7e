// ABOUTME: CLI argument parsing and command routing for skyline
//
// Provides command-line interface for:
// - Running the master with its broker and worker pool (serve, default)
// - Running one worker process (worker, hidden; used by the supervisor)
// - Issuing a single diagnostic call through the broker (call)

pub mod call;
pub mod serve;
pub mod worker;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Clustered REST workers sharing one outward connection
#[derive(Parser)]
#[command(name = "skyline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log human-readable output to stderr instead of the JSONL log file
    #[arg(long, global = true)]
    pub log_stderr: bool,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the master: broker relay plus supervised workers (default)
    Serve(ServeArgs),

    /// Run a single worker process
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Send one JSON payload through the broker and print the reply
    Call(CallArgs),
}

/// Arguments for the serve command
#[derive(clap::Args, Default)]
pub struct ServeArgs {
    /// Configuration file (skips discovery of other config files)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of worker processes (defaults to available parallelism)
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Arguments for the worker command
#[derive(clap::Args)]
pub struct WorkerArgs {
    /// Worker sequence number assigned by the supervisor
    #[arg(long)]
    pub id: u32,

    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Arguments for the call command
#[derive(clap::Args)]
pub struct CallArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// JSON payload, e.g. '{"op":"ping"}'
    pub payload: String,
}

impl Commands {
    /// Explicit config file given to this command
    pub fn config_path(&self) -> Option<&Path> {
        match self {
            Self::Serve(args) => args.config.as_deref(),
            Self::Worker(args) => args.config.as_deref(),
            Self::Call(args) => args.config.as_deref(),
        }
    }

    /// Process role, used to name the log file
    pub fn role(&self) -> String {
        match self {
            Self::Serve(_) => "master".to_string(),
            Self::Worker(args) => format!("worker-{}", args.id),
            Self::Call(_) => "call".to_string(),
        }
    }
}
