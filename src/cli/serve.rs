// ABOUTME: Master role: start the broker relay, then supervise the worker pool
//
// Shutdown order on Ctrl-C / SIGTERM: stop respawning, terminate workers,
// stop the broker and remove its socket files.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use super::ServeArgs;
use skyline::broker::Broker;
use skyline::broker::adapter::{ExternalClient, TcpExternalClient};
use skyline::config::SkylineConfig;
use skyline::server::shutdown_signal;
use skyline::supervisor::{WorkerCommand, WorkerSupervisor};

pub async fn execute(args: ServeArgs, mut config: SkylineConfig, log_stderr: bool) -> Result<()> {
    if let Some(workers) = args.workers {
        config.workers = Some(workers);
    }
    let workers = config.worker_count();

    let adapter: Option<Arc<dyn ExternalClient>> = match &config.external {
        Some(external) => {
            let client = TcpExternalClient::connect(&external.address)
                .await
                .with_context(|| format!("Failed to connect to external service {}", external.address))?;
            Some(Arc::new(client))
        }
        None => None,
    };

    let mut broker = Broker::new(config.broker.clone(), adapter);
    broker.start().await.context("Failed to start broker")?;

    let command = WorkerCommand::current_exe(args.config.as_deref(), log_stderr)
        .context("Failed to resolve worker command")?;
    let mut supervisor = WorkerSupervisor::new(command, workers);
    if let Err(e) = supervisor.start() {
        broker.stop().await.ok();
        return Err(e).context("Failed to start workers");
    }

    info!(
        workers,
        port = config.port,
        external = config.external.is_some(),
        "Master started"
    );

    supervisor.run(shutdown_signal()).await;
    broker.stop().await.context("Failed to stop broker")?;
    info!(respawns = supervisor.respawn_count(), "Master stopped");
    Ok(())
}
