// ABOUTME: Worker startup pipeline: storage, collections, resources, then listen
// ABOUTME: Each stage joins its units fail-fast before the next stage starts

use std::sync::Arc;

use axum::Router;
use futures_util::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info};

use super::resource::{ResourceContext, ResourceError, ResourceRegistry};
use crate::client::{BrokerClient, ClientError};
use crate::config::SkylineConfig;
use crate::storage::{DefaultConnector, Storage, StorageConnector, StorageError};

/// Startup stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Open the storage connection named by `storage_uri`
    Storage,
    /// Create the configured collections; worker 1 also builds indexes when `index_db` is set
    Collections,
    /// Construct and initialize every configured resource
    Resources,
    /// Bind the shared port and serve
    Listen,
}

/// What happened to a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran to completion
    Ran(Stage),
    /// Nothing was configured for the stage
    Skipped(Stage),
}

/// Any of these aborts the worker's startup; the endpoint never listens.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Broker connection failed: {0}")]
    Connect(#[from] ClientError),

    #[error("Storage connection failed: {0}")]
    Storage(#[source] StorageError),

    #[error("Collection {name} failed to initialize: {source}")]
    Collection {
        name: String,
        #[source]
        source: StorageError,
    },

    #[error("Resource {name} failed to initialize: {source}")]
    Resource {
        name: String,
        #[source]
        source: ResourceError,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serving endpoint failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Result of the first three stages, ready to be served.
pub struct Prepared {
    pub storage: Option<Arc<dyn Storage>>,
    /// Routes registered by every resource, merged in configured order
    pub router: Router,
    pub stages: Vec<StageOutcome>,
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prepared")
            .field("storage", &self.storage.as_ref().map(|s| s.uri().to_string()))
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

pub struct StartupPipeline {
    config: Arc<SkylineConfig>,
    worker_id: u32,
    registry: ResourceRegistry,
    connector: Arc<dyn StorageConnector>,
}

impl StartupPipeline {
    /// Pipeline with the built-in resources and storage schemes.
    #[must_use]
    pub fn new(config: Arc<SkylineConfig>, worker_id: u32) -> Self {
        Self {
            config,
            worker_id,
            registry: ResourceRegistry::with_builtins(),
            connector: Arc::new(DefaultConnector),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn StorageConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub const fn config(&self) -> &Arc<SkylineConfig> {
        &self.config
    }

    pub const fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Indexes are built by the first worker only.
    #[must_use]
    pub fn ensure_indexes(&self) -> bool {
        self.config.index_db && self.worker_id == 1
    }

    /// Run storage, collection and resource stages.
    pub async fn prepare(&self, client: BrokerClient) -> Result<Prepared, StartupError> {
        let worker_id = self.worker_id;
        self.registry
            .ensure_known(&self.config.resources)
            .map_err(|source| StartupError::Resource {
                name: unknown_name(&source),
                source,
            })?;

        let mut stages = Vec::with_capacity(3);

        // Stage 1
        let storage = match &self.config.storage_uri {
            Some(uri) => {
                let storage = self
                    .connector
                    .connect(uri, self.ensure_indexes())
                    .await
                    .map_err(StartupError::Storage)?;
                stages.push(StageOutcome::Ran(Stage::Storage));
                Some(storage)
            }
            None => {
                debug!(worker_id, "No storage configured, skipping storage stages");
                stages.push(StageOutcome::Skipped(Stage::Storage));
                None
            }
        };

        // Stage 2
        match &storage {
            Some(storage) => {
                try_join_all(self.config.collections.iter().map(|(name, schema)| {
                    let storage = Arc::clone(storage);
                    async move {
                        storage
                            .add_collection(name, schema)
                            .await
                            .map_err(|source| StartupError::Collection {
                                name: name.clone(),
                                source,
                            })
                    }
                }))
                .await?;
                info!(
                    worker_id,
                    collections = self.config.collections.len(),
                    "Collections initialized"
                );
                stages.push(StageOutcome::Ran(Stage::Collections));
            }
            None => stages.push(StageOutcome::Skipped(Stage::Collections)),
        }

        // Stage 3
        let ctx = ResourceContext {
            client,
            storage: storage.clone(),
            config: Arc::clone(&self.config),
            worker_id,
        };
        let resources = self
            .registry
            .build(&self.config.resources, &ctx)
            .map_err(|source| StartupError::Resource {
                name: unknown_name(&source),
                source,
            })?;

        let routers = try_join_all(resources.iter().map(|resource| async move {
            resource
                .init()
                .await
                .map_err(|source| StartupError::Resource {
                    name: resource.name().to_string(),
                    source,
                })
        }))
        .await?;

        let router = routers.into_iter().fold(Router::new(), Router::merge);
        info!(worker_id, resources = ?self.config.resources, "Resources initialized");
        stages.push(StageOutcome::Ran(Stage::Resources));

        Ok(Prepared {
            storage,
            router,
            stages,
        })
    }
}

fn unknown_name(error: &ResourceError) -> String {
    match error {
        ResourceError::Unknown(name) => name.clone(),
        _ => String::new(),
    }
}
