// ABOUTME: Main entry point for skyline, master and worker roles in one binary
//
// Binary: skyline
// Usage: skyline [COMMAND]
// - No command / serve: master (broker relay + worker supervisor)
// - worker: one worker process, spawned by the master
// - call: send one payload through a running broker

#![allow(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;

mod cli;

use skyline::config::SkylineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let command = args
        .command
        .unwrap_or_else(|| cli::Commands::Serve(cli::ServeArgs::default()));

    let config = SkylineConfig::load(command.config_path()).context("Failed to load configuration")?;

    setup_logging(&command.role(), &config.log_dir(), args.log_stderr)?;
    setup_panic_handler();

    match command {
        cli::Commands::Serve(serve_args) => cli::serve::execute(serve_args, config, args.log_stderr).await,
        cli::Commands::Worker(worker_args) => cli::worker::execute(worker_args, config).await,
        cli::Commands::Call(call_args) => cli::call::execute(call_args, config).await,
    }
}

fn setup_logging(role: &str, log_dir: &Path, log_stderr: bool) -> Result<()> {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "skyline=info".into());

    if log_stderr {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
        return Ok(());
    }

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    // One JSONL file per process
    let log_file = log_dir.join(format!(
        "skyline-{}-{}-{}.jsonl",
        role,
        std::process::id(),
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to create log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false),
        )
        .with(filter)
        .init();
    Ok(())
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Process panicked: {}", panic_info);
        eprintln!("Process panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
