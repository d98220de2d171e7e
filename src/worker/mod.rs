// ABOUTME: Worker process runtime: broker connection, startup pipeline and serving endpoint
// ABOUTME: A worker listens only after every startup stage has succeeded

pub mod resource;
pub mod resources;
pub mod startup;

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{BrokerClient, ClientError};
use crate::config::SkylineConfig;
use crate::server;
pub use resource::{Resource, ResourceContext, ResourceError, ResourceRegistry};
pub use startup::{Prepared, Stage, StageOutcome, StartupError, StartupPipeline};

/// Run worker `worker_id` until Ctrl-C or SIGTERM.
pub async fn run(config: SkylineConfig, worker_id: u32) -> Result<(), StartupError> {
    run_until(
        StartupPipeline::new(Arc::new(config), worker_id),
        server::shutdown_signal(),
    )
    .await
}

/// Run the full startup pipeline, then serve until `shutdown` resolves.
pub async fn run_until<F>(pipeline: StartupPipeline, shutdown: F) -> Result<(), StartupError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = Arc::clone(pipeline.config());
    let worker_id = pipeline.worker_id();

    let front = config.broker.front_path().map_err(ClientError::from)?;
    let client = BrokerClient::connect(&front, &config.broker).await?;
    debug!(worker_id, identity = client.identity(), "Connected to broker");

    let prepared = match pipeline.prepare(client.clone()).await {
        Ok(prepared) => prepared,
        Err(e) => {
            client.close().await;
            return Err(e);
        }
    };

    let Prepared {
        router, mut stages, ..
    } = prepared;
    let app = server::build_router(router, &config);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = match server::bind_shared(&config.host, config.port).await {
        Ok(listener) => listener,
        Err(source) => {
            client.close().await;
            return Err(StartupError::Bind { addr, source });
        }
    };

    stages.push(StageOutcome::Ran(Stage::Listen));
    debug!(worker_id, stages = ?stages, "Startup complete");

    let local = listener
        .local_addr()
        .map_or(addr, |local| local.to_string());
    if worker_id == 1 {
        info!(addr = %local, "Skyline listening");
    } else {
        debug!(worker_id, addr = %local, "Worker listening");
    }

    let result = server::serve(listener, app, shutdown)
        .await
        .map_err(StartupError::Serve);

    client.close().await;
    info!(worker_id, "Worker stopped");
    result
}
