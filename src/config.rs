//! Configuration for the distance pipeline.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::DestinationClass;
use crate::osrm::OsrmConfig;
use crate::sql;

/// Largest chunk the upsert statements are built for. Keeps the bound
/// parameter count under SQLite's limit.
pub const MAX_CHUNK_SIZE: usize = 5_000;

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,

    pub catalog: CatalogConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    /// Destination classes to compute distances for.
    pub classes: Vec<DestinationClass>,

    #[serde(default)]
    pub run: RunConfig,
}

/// Result store location and write behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database that receives results, progress and the run log.
    pub path: String,

    /// How long a worker waits on a locked database (milliseconds).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Rows per upsert statement / commit chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_chunk_size() -> usize {
    500
}

/// Where the study region's origins, destinations and partitions live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// SQLite database produced by upstream data preparation.
    pub path: String,

    #[serde(default = "default_origin_table")]
    pub origin_table: String,

    #[serde(default = "default_destination_table")]
    pub destination_table: String,

    /// Optional table of explicit partition bounds.
    #[serde(default)]
    pub partition_table: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: "region.sqlite".to_string(),
            origin_table: default_origin_table(),
            destination_table: default_destination_table(),
            partition_table: None,
        }
    }
}

fn default_origin_table() -> String {
    "origin".to_string()
}

fn default_destination_table() -> String {
    "destination".to_string()
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads, each with its own store connection and
    /// routing session.
    pub workers: usize,

    /// Origins sent to the routing engine per call.
    pub max_origins_per_solve: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_origins_per_solve: 1_000,
        }
    }
}

/// Which routing engine to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Osrm,
    Haversine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub engine: EngineKind,

    pub osrm: OsrmConfig,

    /// Straight-line to network distance factor for the haversine engine.
    pub circuity: f64,

    /// Concurrent engine sessions allowed. Defaults to the worker count.
    pub licenses: Option<usize>,

    /// Seconds a worker waits for a license before giving up.
    pub license_wait_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Osrm,
            osrm: OsrmConfig::default(),
            circuity: 1.0,
            licenses: None,
            license_wait_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Dispatch the pool once more when the first pass ends short with
    /// partition errors.
    pub retry_shortfall: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retry_shortfall: true,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Number of concurrent routing sessions.
    pub fn licenses(&self) -> usize {
        self.routing.licenses.unwrap_or(self.pool.workers)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1".into()));
        }
        if self.pool.max_origins_per_solve == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_origins_per_solve must be at least 1".into(),
            ));
        }
        if self.store.chunk_size == 0 || self.store.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "store.chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if self.store.path.is_empty() {
            return Err(ConfigError::Invalid("store.path must be set".into()));
        }

        let mut tables = vec![&self.catalog.origin_table, &self.catalog.destination_table];
        tables.extend(self.catalog.partition_table.as_ref());
        for table in tables {
            if !sql::is_valid_identifier(table) {
                return Err(ConfigError::Invalid(format!(
                    "catalog table name '{table}' is not a valid identifier"
                )));
            }
        }

        if self.classes.is_empty() {
            return Err(ConfigError::Invalid("at least one destination class is required".into()));
        }
        let mut seen = HashSet::new();
        for class in &self.classes {
            if class.name.trim().is_empty() {
                return Err(ConfigError::Invalid("destination class name is empty".into()));
            }
            if !seen.insert(class.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "destination class '{}' is listed twice",
                    class.name
                )));
            }
            if class.cutoff_m == 0 {
                return Err(ConfigError::Invalid(format!(
                    "destination class '{}' needs a positive cutoff",
                    class.name
                )));
            }
        }

        if self.routing.engine == EngineKind::Haversine && self.routing.circuity < 1.0 {
            return Err(ConfigError::Invalid("routing.circuity must be at least 1.0".into()));
        }
        if self.licenses() == 0 {
            return Err(ConfigError::Invalid("routing.licenses must be at least 1".into()));
        }
        Ok(())
    }

    /// A documented starting point for `generate-config`.
    pub fn sample() -> Self {
        Self {
            store: StoreConfig::new("distances.sqlite"),
            catalog: CatalogConfig {
                partition_table: Some("partition".to_string()),
                ..CatalogConfig::default()
            },
            pool: PoolConfig::default(),
            routing: RoutingConfig::default(),
            classes: vec![
                DestinationClass::closest("supermarket", 1_000),
                DestinationClass::closest("convenience", 1_000),
                DestinationClass::within("pt_stop", 400),
                DestinationClass::closest("park", 400).with_min_count(3),
            ],
            run: RunConfig::default(),
        }
    }
}
