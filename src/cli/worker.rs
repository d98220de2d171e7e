// ABOUTME: Worker role entry point, spawned by the master's supervisor

use anyhow::{Context, Result};

use super::WorkerArgs;
use skyline::config::SkylineConfig;

pub async fn execute(args: WorkerArgs, config: SkylineConfig) -> Result<()> {
    skyline::worker::run(config, args.id)
        .await
        .with_context(|| format!("Worker {} failed", args.id))
}
