// ABOUTME: Configuration management for skyline
// Handles cluster options, broker sockets, the external adapter and throttle settings

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod broker;

pub use broker::BrokerConfig;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config file was not valid TOML or had the wrong shape
    #[error("Failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// An environment override had an unusable value
    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
}

/// Top-level configuration shared by the master and every worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkylineConfig {
    /// Address the serving endpoint binds to
    pub host: String,

    /// Port the serving endpoint listens on
    pub port: u16,

    /// Number of worker processes (default: available parallelism)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Shared storage connection string; absent skips the storage stages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,

    /// Build storage indexes (only worker 1 does so)
    pub index_db: bool,

    /// Named collection schemas initialized at startup
    pub collections: BTreeMap<String, serde_json::Value>,

    /// Registry identifiers of the resources each worker runs
    pub resources: Vec<String>,

    /// Origins allowed by the cross-origin policy; absent disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_origins: Option<Vec<String>>,

    /// Directory for JSONL log files (default: ~/.skyline/logs/)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Broker relay sockets and timeouts
    pub broker: BrokerConfig,

    /// Outward connection owned by the master; absent means loop-back mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,

    /// Per-address rate limiting on the serving endpoint
    pub throttle: ThrottleConfig,
}

/// Outward connection to the external service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalConfig {
    /// `host:port` of the external service
    pub address: String,
}

/// Token-bucket throttle keyed by client address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Requests allowed in a burst
    pub burst: u32,

    /// Sustained requests per second
    pub rate: u32,

    /// Per-address overrides (`rate = 0` means unlimited)
    pub overrides: HashMap<String, ThrottleRule>,

    /// Key on the last `x-forwarded-for` hop instead of the socket peer.
    /// Only safe behind a proxy that appends to the header.
    pub trust_forwarded: bool,
}

/// One throttle rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    /// Requests allowed in a burst
    pub burst: u32,
    /// Sustained requests per second
    pub rate: u32,
}

impl ThrottleRule {
    /// A zero rate disables throttling for its address
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.rate == 0
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            burst: 100,
            rate: 50,
            overrides: HashMap::new(),
            trust_forwarded: false,
        }
    }
}

impl ThrottleConfig {
    /// Rule that applies to `address`
    #[must_use]
    pub fn rule_for(&self, address: &str) -> ThrottleRule {
        self.overrides.get(address).copied().unwrap_or(ThrottleRule {
            burst: self.burst,
            rate: self.rate,
        })
    }
}

impl Default for SkylineConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: None,
            storage_uri: None,
            index_db: false,
            collections: BTreeMap::new(),
            resources: vec![],
            allow_origins: None,
            log_dir: None,
            broker: BrokerConfig::default(),
            external: None,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl SkylineConfig {
    /// Load configuration.
    ///
    /// With an explicit path only that file is read. Otherwise the system, user
    /// and local files are merged in that order, later keys winning. Environment
    /// overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let paths = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => Self::get_config_paths().into_iter().filter(|p| p.exists()).collect(),
        };

        let mut merged = toml::Table::new();
        for path in &paths {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;

            let table: toml::Table = toml::from_str(&content).map_err(|source| {
                ConfigError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;

            merge_tables(&mut merged, table);
        }

        let mut config: Self = toml::Value::Table(merged).try_into().map_err(|source| {
            ConfigError::Parse {
                path: paths.last().cloned().unwrap_or_default(),
                source,
            }
        })?;

        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Parse a single TOML document (no file discovery, no env overrides).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Apply `SKYLINE_*` overrides.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "SKYLINE_PORT" => {
                    self.port = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidOverride { key, value })?;
                }
                "SKYLINE_WORKERS" => {
                    let workers = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidOverride { key, value })?;
                    self.workers = Some(workers);
                }
                "SKYLINE_STORAGE_URI" => {
                    self.storage_uri = (!value.is_empty()).then_some(value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Number of worker processes to run
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get))
    }

    /// Directory for log files
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".skyline")
                .join("logs")
        })
    }

    /// Get configuration file paths, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/skyline/config.toml")];

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".skyline").join("config.toml"));
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".skyline").join("config.toml"));
        }

        paths
    }
}

/// Deep-merge `other` into `base`; nested tables merge, everything else replaces
fn merge_tables(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
