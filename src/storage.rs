//! Shared storage handle used during worker startup.
//!
//! Workers open one storage connection (when `storage_uri` is set) and then
//! register every configured collection on it. The connection is chosen by URI
//! scheme; `memory://` is built in and keeps everything in process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The URI has no `scheme://` prefix
    #[error("Invalid storage URI: {0}")]
    InvalidUri(String),

    /// No connector handles this scheme
    #[error("Unsupported storage scheme: {0}")]
    UnsupportedScheme(String),

    /// A collection schema was rejected
    #[error("Invalid schema for collection {name}: {reason}")]
    InvalidSchema { name: String, reason: String },

    /// Backend-specific failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// An open storage connection shared by every resource in a worker.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Connection string this handle was opened with
    fn uri(&self) -> &str;

    /// Create or update a named collection.
    async fn add_collection(&self, name: &str, schema: &Value) -> Result<(), StorageError>;

    /// Names of registered collections, sorted
    async fn collection_names(&self) -> Vec<String>;
}

/// Opens storage connections.
#[async_trait]
pub trait StorageConnector: Send + Sync {
    /// Open `uri`. Indexes are built only when `ensure_indexes` is set.
    async fn connect(&self, uri: &str, ensure_indexes: bool) -> Result<Arc<dyn Storage>, StorageError>;
}

/// Connector that understands the built-in schemes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl StorageConnector for DefaultConnector {
    async fn connect(&self, uri: &str, ensure_indexes: bool) -> Result<Arc<dyn Storage>, StorageError> {
        let (scheme, _rest) = uri
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;

        match scheme {
            "memory" => {
                info!(uri = %uri, ensure_indexes, "Opened in-memory storage");
                Ok(Arc::new(MemoryStorage::new(uri, ensure_indexes)))
            }
            other => Err(StorageError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct Collection {
    schema: Value,
    indexes: Vec<String>,
}

/// In-process storage for `memory://` URIs.
#[derive(Debug)]
pub struct MemoryStorage {
    uri: String,
    ensure_indexes: bool,
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStorage {
    /// Empty store
    #[must_use]
    pub fn new(uri: &str, ensure_indexes: bool) -> Self {
        Self {
            uri: uri.to_string(),
            ensure_indexes,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Indexes built for `name` (empty unless indexes were requested)
    pub async fn indexes(&self, name: &str) -> Option<Vec<String>> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|collection| collection.indexes.clone())
    }

    /// Schema registered for `name`
    pub async fn schema(&self, name: &str) -> Option<Value> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|collection| collection.schema.clone())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn add_collection(&self, name: &str, schema: &Value) -> Result<(), StorageError> {
        let Some(fields) = schema.as_object() else {
            return Err(StorageError::InvalidSchema {
                name: name.to_string(),
                reason: "schema must be a table".to_string(),
            });
        };

        let indexes = if self.ensure_indexes {
            match fields.get("indexes") {
                None => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| StorageError::InvalidSchema {
                            name: name.to_string(),
                            reason: "index names must be strings".to_string(),
                        })
                    })
                    .collect::<Result<_, _>>()?,
                Some(_) => {
                    return Err(StorageError::InvalidSchema {
                        name: name.to_string(),
                        reason: "indexes must be a list".to_string(),
                    });
                }
            }
        } else {
            Vec::new()
        };

        debug!(collection = %name, indexes = indexes.len(), "Collection ready");
        self.collections.write().await.insert(
            name.to_string(),
            Collection {
                schema: schema.clone(),
                indexes,
            },
        );
        Ok(())
    }

    async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
