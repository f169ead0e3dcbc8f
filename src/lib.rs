//! access-pipeline core
//!
//! Partitioned, resumable network-distance computation from origins to
//! classes of destinations, fanned out over independent workers.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod haversine;
pub mod license;
pub mod model;
pub mod osrm;
pub mod pool;
pub mod progress;
pub mod sql;
pub mod store;
pub mod traits;

pub use catalog::{Bounds, MemoryCatalog};
pub use config::Config;
pub use controller::{CompletionGoal, RunController, RunReport, RunVerdict, completion_goal};
pub use error::{PipelineError, RoutingError};
pub use model::{Destination, DestinationClass, Origin, QueryMode, RunStatus};
pub use store::ResultStore;
pub use traits::{PartitionCatalog, RoutingEngine, RoutingSession};
