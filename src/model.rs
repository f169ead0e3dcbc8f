//! Data model shared by the catalog, the routing engines and the store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type OriginId = i64;
pub type DestinationId = i64;
pub type PartitionId = i64;

/// An address point whose access to destinations is being measured.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub id: OriginId,
    pub partition: PartitionId,
    pub lat: f64,
    pub lng: f64,
}

impl Origin {
    pub fn new(id: OriginId, partition: PartitionId, lat: f64, lng: f64) -> Self {
        Self { id, partition, lat, lng }
    }

    /// Location coordinates (lat, lng).
    pub fn location(&self) -> (f64, f64) {
        (self.lat, self.lng)
    }
}

/// An amenity of some destination class.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub id: DestinationId,
    pub class: String,
    pub lat: f64,
    pub lng: f64,
}

impl Destination {
    pub fn new(id: DestinationId, class: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id,
            class: class.into(),
            lat,
            lng,
        }
    }

    /// Location coordinates (lat, lng).
    pub fn location(&self) -> (f64, f64) {
        (self.lat, self.lng)
    }
}

/// How results for a destination class are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// One row per (origin, class): the nearest destination.
    #[default]
    Closest,
    /// One row per (origin, class, destination) for every destination
    /// within the cutoff.
    Within,
}

/// A named category of destination with its own cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationClass {
    pub name: String,
    /// Maximum network distance in metres.
    pub cutoff_m: u32,
    #[serde(default)]
    pub mode: QueryMode,
    /// Minimum number of destinations the study region must hold for the
    /// class to be processed at all. Defaults to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<usize>,
}

impl DestinationClass {
    pub fn closest(name: impl Into<String>, cutoff_m: u32) -> Self {
        Self {
            name: name.into(),
            cutoff_m,
            mode: QueryMode::Closest,
            min_count: None,
        }
    }

    pub fn within(name: impl Into<String>, cutoff_m: u32) -> Self {
        Self {
            mode: QueryMode::Within,
            ..Self::closest(name, cutoff_m)
        }
    }

    pub fn with_min_count(mut self, min_count: usize) -> Self {
        self.min_count = Some(min_count);
        self
    }

    /// Number of destinations required in the region, never below one.
    pub fn required_count(&self) -> usize {
        self.min_count.unwrap_or(1).max(1)
    }
}

/// One network distance from an origin to a destination class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceResult {
    pub origin_id: OriginId,
    pub dest_class: String,
    pub dest_id: Option<DestinationId>,
    pub distance_m: u32,
    pub node_id: Option<i64>,
}

/// Everything resolved for one origin in one class. An empty `rows` means
/// the origin was attempted and nothing was reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginOutcome {
    pub origin_id: OriginId,
    pub rows: Vec<DistanceResult>,
}

impl OriginOutcome {
    pub fn unresolved(origin_id: OriginId) -> Self {
        Self {
            origin_id,
            rows: Vec::new(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A single origin/destination distance returned by a routing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolvedPair {
    pub origin_id: OriginId,
    pub dest_id: DestinationId,
    pub distance_m: u32,
    pub node_id: Option<i64>,
}

/// Result of one routing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    Solved(Vec<SolvedPair>),
    /// Part of the batch was solved; the engine reported no solution for
    /// the origins in `unsolved`.
    Partial {
        pairs: Vec<SolvedPair>,
        unsolved: Vec<OriginId>,
    },
    /// The engine found no feasible solution for the whole batch.
    NoSolution,
}

/// Why an attempted origin has no stored distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    NoSolution,
    NoPath,
    NoDestinations,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::NoSolution => "no-solution",
            UnresolvedReason::NoPath => "no-path",
            UnresolvedReason::NoDestinations => "no-destinations-in-region",
        }
    }
}

/// Latest outcome recorded for a (partition, class) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunStatus {
    NoOrigins,
    NoDestinationsInRegion,
    Solved,
    NoSolution,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NoOrigins => "no-origins",
            RunStatus::NoDestinationsInRegion => "no-destinations-in-region",
            RunStatus::Solved => "solved",
            RunStatus::NoSolution => "no-solution",
            RunStatus::Error => "error",
        }
    }

    /// Statuses a human should look at after the run.
    pub fn needs_review(&self) -> bool {
        matches!(self, RunStatus::NoSolution | RunStatus::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-origins" => Ok(RunStatus::NoOrigins),
            "no-destinations-in-region" => Ok(RunStatus::NoDestinationsInRegion),
            "solved" => Ok(RunStatus::Solved),
            "no-solution" => Ok(RunStatus::NoSolution),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// One row of the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub partition_id: PartitionId,
    pub dest_class: String,
    pub status: RunStatus,
    pub solved: u64,
    pub unresolved: u64,
    pub elapsed_minutes: f64,
    pub message: Option<String>,
}

impl RunLogEntry {
    pub fn new(partition_id: PartitionId, dest_class: impl Into<String>, status: RunStatus) -> Self {
        Self {
            partition_id,
            dest_class: dest_class.into(),
            status,
            solved: 0,
            unresolved: 0,
            elapsed_minutes: 0.0,
            message: None,
        }
    }
}
