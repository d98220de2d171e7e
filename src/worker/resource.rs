// ABOUTME: Resource trait and the registry that maps configured names to resource factories
// ABOUTME: Every resource gets the worker's broker client, storage handle and config

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use thiserror::Error;

use crate::client::BrokerClient;
use crate::config::SkylineConfig;
use crate::storage::{Storage, StorageError};

use super::resources::{PingResource, RelayResource};

/// Resource failures, all of which abort worker startup
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No factory is registered under this name
    #[error("Unknown resource: {0}")]
    Unknown(String),

    /// The resource's own initialization failed
    #[error("Resource {name} failed to initialize: {reason}")]
    Init { name: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What a resource is constructed with.
#[derive(Clone)]
pub struct ResourceContext {
    /// The worker's single broker connection
    pub client: BrokerClient,
    /// Shared storage, when `storage_uri` is configured
    pub storage: Option<Arc<dyn Storage>>,
    /// Settings the worker was started with
    pub config: Arc<SkylineConfig>,
    /// Sequence number from the supervisor; 1 is the first worker ever started
    pub worker_id: u32,
}

/// A pluggable capability that registers routes on the serving endpoint.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Registry identifier
    fn name(&self) -> &str;

    /// Called exactly once during startup. Returns the routes this resource serves.
    async fn init(&self) -> Result<Router, ResourceError>;
}

pub type ResourceFactory = Arc<dyn Fn(ResourceContext) -> Box<dyn Resource> + Send + Sync>;

/// Maps stable identifiers to resource factories.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    factories: BTreeMap<String, ResourceFactory>,
}

impl ResourceRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `ping` and `relay`
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ping", |ctx| Box::new(PingResource::new(ctx)));
        registry.register("relay", |ctx| Box::new(RelayResource::new(ctx)));
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ResourceContext) -> Box<dyn Resource> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered identifiers, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Fail on the first name with no factory.
    pub fn ensure_known(&self, names: &[String]) -> Result<(), ResourceError> {
        match names.iter().find(|name| !self.contains(name)) {
            Some(unknown) => Err(ResourceError::Unknown(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Construct every named resource with its own copy of `ctx`.
    pub fn build(
        &self,
        names: &[String],
        ctx: &ResourceContext,
    ) -> Result<Vec<Box<dyn Resource>>, ResourceError> {
        names
            .iter()
            .map(|name| {
                self.factories
                    .get(name)
                    .map(|factory| factory(ctx.clone()))
                    .ok_or_else(|| ResourceError::Unknown(name.clone()))
            })
            .collect()
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("names", &self.names())
            .finish()
    }
}
