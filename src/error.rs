//! Error types for the distance pipeline.
//!
//! Each concern owns its own enum; [`PipelineError`] is what the run
//! controller hands back to callers.

use std::io;

use thiserror::Error;

use crate::model::PartitionId;

/// Configuration could not be read or is not usable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures while loading or querying the partition catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
    #[error("{kind} {id} has invalid coordinates ({lat}, {lng})")]
    InvalidCoordinate {
        kind: &'static str,
        id: i64,
        lat: f64,
        lng: f64,
    },
}

/// Failures from the result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("progress counter missing; store was not bootstrapped")]
    MissingProgress,
    #[error("stored value out of range: {0}")]
    OutOfRange(String),
}

/// Failures reported by a routing engine.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No license / session slot could be obtained in time.
    #[error("routing license unavailable: {0}")]
    License(String),
    /// The engine could not be reached after all retries.
    #[error("routing engine unavailable: {0}")]
    Unavailable(String),
    /// The engine answered but refused the request.
    #[error("routing engine rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("routing transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RoutingError {
    /// Fatal errors abort the worker that hit them; everything else is
    /// recorded against the partition and the worker moves on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RoutingError::License(_) | RoutingError::Unavailable(_))
    }
}

/// Anything that can stop a partition/class unit from completing.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        match self {
            HandlerError::Routing(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// Errors that prevent the run controller from reaching a verdict.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
