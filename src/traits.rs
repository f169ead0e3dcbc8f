//! Core seams of the distance pipeline.
//!
//! These are intentionally minimal. The pipeline only ever talks to the
//! catalog and the routing engine through them, so concrete backends
//! (SQLite-loaded catalogs, OSRM, straight-line estimates, test doubles)
//! can be swapped without touching the scheduling code.

use crate::error::{CatalogError, RoutingError};
use crate::model::{Destination, Origin, PartitionId, SolveOutcome};

/// Read-only view of origins, destinations and their partitions.
///
/// Implementations are shared by every worker for the whole run and must
/// not change while it is in progress.
pub trait PartitionCatalog: Sync {
    /// All partition ids, including partitions without origins.
    fn list_partitions(&self) -> Vec<PartitionId>;

    /// Origins belonging to a partition.
    fn origins_in(&self, partition: PartitionId) -> Result<Vec<Origin>, CatalogError>;

    /// Destinations of one class within `cutoff_m` metres of the
    /// partition's bounding geometry. May be empty.
    fn destinations_near(
        &self,
        partition: PartitionId,
        class: &str,
        cutoff_m: u32,
    ) -> Result<Vec<Destination>, CatalogError>;

    /// Total origins across every partition.
    fn origin_count(&self) -> usize;

    /// Number of destinations of a class in the whole study region.
    fn destination_count(&self, class: &str) -> usize;
}

/// Factory for routing sessions.
///
/// A session is checked out once per worker and is never shared between
/// threads. Whatever limited resource backs it (a license seat, a
/// connection slot) must be released when the session is dropped.
pub trait RoutingEngine: Sync {
    type Session: RoutingSession;

    fn checkout(&self) -> Result<Self::Session, RoutingError>;
}

/// A worker-owned handle on the routing engine.
pub trait RoutingSession {
    /// Network distances from `origins` to `destinations`, limited to
    /// `cutoff_m` metres.
    ///
    /// `destinations` always belong to a single class. Pairs beyond the
    /// cutoff or without a path are simply absent, so a batch with nothing
    /// in reach is `Solved` with no pairs. `NoSolution` means the engine
    /// could not solve the batch at all, `Partial` that it could not solve
    /// it for some origins.
    fn solve_distances(
        &mut self,
        origins: &[Origin],
        destinations: &[Destination],
        cutoff_m: u32,
    ) -> Result<SolveOutcome, RoutingError>;
}
