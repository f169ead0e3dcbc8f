//! Test fixtures for access-pipeline.
//!
//! Provides:
//! - Real Melbourne / Geelong locations (from OpenStreetMap)
//! - Builders for origins, destinations, catalogs and file-backed configs
//! - A scripted routing engine that records every solve call

#![allow(dead_code)]

pub mod melbourne_locations;

pub use melbourne_locations::*;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use access_pipeline::config::{CatalogConfig, Config, EngineKind, PoolConfig, RoutingConfig, RunConfig, StoreConfig};
use access_pipeline::haversine::haversine_m;
use access_pipeline::model::{DestinationId, OriginId, PartitionId, SolveOutcome, SolvedPair};
use access_pipeline::{Destination, DestinationClass, Origin, RoutingEngine, RoutingError, RoutingSession};

// ============================================================================
// Builders
// ============================================================================

/// `count` origins in `partition`, ids starting at `first_id`, spaced
/// `step_m` metres apart eastward from `anchor`.
pub fn origins_near(
    partition: PartitionId,
    first_id: OriginId,
    count: usize,
    anchor: &Location,
    step_m: f64,
) -> Vec<Origin> {
    east_of(anchor, count, step_m)
        .into_iter()
        .enumerate()
        .map(|(index, (lat, lng))| Origin::new(first_id + index as OriginId, partition, lat, lng))
        .collect()
}

/// Destinations of one class at the given locations, ids starting at
/// `first_id`.
pub fn destinations_at(class: &str, first_id: DestinationId, locations: &[Location]) -> Vec<Destination> {
    locations
        .iter()
        .enumerate()
        .map(|(index, location)| {
            Destination::new(first_id + index as DestinationId, class, location.lat, location.lng)
        })
        .collect()
}

/// File-backed configuration in `dir` (multiple worker connections need a
/// real database file).
pub fn test_config(dir: &Path, classes: Vec<DestinationClass>, workers: usize) -> Config {
    Config {
        store: StoreConfig {
            path: dir.join("results.sqlite").to_string_lossy().into_owned(),
            busy_timeout_ms: 10_000,
            chunk_size: 500,
        },
        catalog: CatalogConfig {
            path: dir.join("region.sqlite").to_string_lossy().into_owned(),
            ..CatalogConfig::default()
        },
        pool: PoolConfig {
            workers,
            max_origins_per_solve: 1_000,
        },
        routing: RoutingConfig {
            engine: EngineKind::Haversine,
            ..RoutingConfig::default()
        },
        classes,
        run: RunConfig {
            retry_shortfall: false,
        },
    }
}

// ============================================================================
// Scripted routing engine
// ============================================================================

/// One recorded `solve_distances` call.
#[derive(Debug, Clone)]
pub struct SolveCall {
    pub origins: Vec<OriginId>,
    pub destinations: Vec<DestinationId>,
    pub cutoff_m: u32,
}

#[derive(Debug, Clone, Default)]
struct Script {
    /// Origins that never reach any destination.
    unreachable: HashSet<OriginId>,
    /// A batch containing any of these returns `NoSolution`.
    no_solution: HashSet<OriginId>,
    /// Reported unsolved while the rest of their batch is solved.
    partly_unsolved: HashSet<OriginId>,
    /// A batch containing any of these is rejected (non-fatal error).
    rejected: HashSet<OriginId>,
    /// A batch containing any of these makes the engine unavailable.
    fatal: HashSet<OriginId>,
    /// A batch containing any of these panics inside the session.
    panics: HashSet<OriginId>,
}

#[derive(Debug, Default)]
struct Shared {
    calls: Mutex<Vec<SolveCall>>,
    failing_checkouts: AtomicUsize,
    failing_solves: AtomicUsize,
    checkouts: AtomicUsize,
}

/// Deterministic engine: distances are rounded great-circle metres, with
/// scripted failures keyed by origin id.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
    shared: Arc<Shared>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        Arc::make_mut(&mut self.script).unreachable.extend(origins);
        self
    }

    pub fn no_solution_for(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        Arc::make_mut(&mut self.script).no_solution.extend(origins);
        self
    }

    pub fn partly_unsolved(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        Arc::make_mut(&mut self.script).partly_unsolved.extend(origins);
        self
    }

    pub fn panic_on(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        Arc::make_mut(&mut self.script).panics.extend(origins);
        self
    }

    pub fn reject(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        Arc::make_mut(&mut self.script).rejected.extend(origins);
        self
    }

    pub fn fatal_on(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        Arc::make_mut(&mut self.script).fatal.extend(origins);
        self
    }

    /// The first `count` checkouts fail with a license error.
    pub fn fail_checkouts(self, count: usize) -> Self {
        self.shared.failing_checkouts.store(count, Ordering::SeqCst);
        self
    }

    /// The first `count` solve calls are rejected, whatever they contain.
    pub fn fail_solves(self, count: usize) -> Self {
        self.shared.failing_solves.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<SolveCall> {
        self.shared.calls.lock().clone()
    }

    /// Every origin id sent to the engine, in call order.
    pub fn attempted_origins(&self) -> Vec<OriginId> {
        self.calls()
            .into_iter()
            .flat_map(|call| call.origins)
            .collect()
    }

    pub fn checkouts(&self) -> usize {
        self.shared.checkouts.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

impl RoutingEngine for ScriptedEngine {
    type Session = ScriptedSession;

    fn checkout(&self) -> Result<Self::Session, RoutingError> {
        self.shared.checkouts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.shared.failing_checkouts) {
            return Err(RoutingError::License("no seat available".to_string()));
        }
        Ok(ScriptedSession {
            script: Arc::clone(&self.script),
            shared: Arc::clone(&self.shared),
        })
    }
}

pub struct ScriptedSession {
    script: Arc<Script>,
    shared: Arc<Shared>,
}

impl RoutingSession for ScriptedSession {
    fn solve_distances(
        &mut self,
        origins: &[Origin],
        destinations: &[Destination],
        cutoff_m: u32,
    ) -> Result<SolveOutcome, RoutingError> {
        self.shared.calls.lock().push(SolveCall {
            origins: origins.iter().map(|origin| origin.id).collect(),
            destinations: destinations.iter().map(|destination| destination.id).collect(),
            cutoff_m,
        });

        let contains = |set: &HashSet<OriginId>| origins.iter().any(|origin| set.contains(&origin.id));
        if contains(&self.script.panics) {
            panic!("scripted session failure");
        }
        if contains(&self.script.fatal) {
            return Err(RoutingError::Unavailable("engine process exited".to_string()));
        }
        if take_one(&self.shared.failing_solves) || contains(&self.script.rejected) {
            return Err(RoutingError::Rejected {
                code: "InvalidQuery".to_string(),
                message: "scripted rejection".to_string(),
            });
        }
        if contains(&self.script.no_solution) {
            return Ok(SolveOutcome::NoSolution);
        }

        let mut pairs = Vec::new();
        let mut unsolved = Vec::new();
        for origin in origins {
            if self.script.partly_unsolved.contains(&origin.id) {
                unsolved.push(origin.id);
                continue;
            }
            if self.script.unreachable.contains(&origin.id) {
                continue;
            }
            for destination in destinations {
                let distance_m = haversine_m(origin.location(), destination.location()).round() as u32;
                if distance_m <= cutoff_m {
                    pairs.push(SolvedPair {
                        origin_id: origin.id,
                        dest_id: destination.id,
                        distance_m,
                        node_id: Some(destination.id * 100),
                    });
                }
            }
        }
        if unsolved.is_empty() {
            Ok(SolveOutcome::Solved(pairs))
        } else {
            Ok(SolveOutcome::Partial { pairs, unsolved })
        }
    }
}
