//! Haversine routing engine (fallback when OSRM unavailable).
//!
//! Uses great-circle distance scaled by a circuity factor to estimate
//! network distance. Less accurate than OSRM (ignores roads) but always
//! available, which makes it the engine of choice for offline runs.

use std::time::Duration;

use crate::error::RoutingError;
use crate::license::{TokenGuard, TokenPool};
use crate::model::{Destination, Origin, SolveOutcome, SolvedPair};
use crate::traits::{RoutingEngine, RoutingSession};

/// Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two (lat, lng) points in metres.
pub fn haversine_m(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lng1) = from;
    let (lat2, lng2) = to;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Straight-line routing engine.
#[derive(Debug, Clone)]
pub struct HaversineEngine {
    /// Multiplier applied to straight-line distance to approximate the
    /// network (1.0 = as the crow flies).
    pub circuity: f64,
    licenses: Option<TokenPool>,
    license_wait: Duration,
}

impl Default for HaversineEngine {
    fn default() -> Self {
        Self {
            circuity: 1.0,
            licenses: None,
            license_wait: Duration::ZERO,
        }
    }
}

impl HaversineEngine {
    pub fn new(circuity: f64) -> Self {
        Self {
            circuity,
            ..Self::default()
        }
    }

    /// Limits concurrent sessions to the pool's capacity.
    pub fn with_licenses(mut self, licenses: TokenPool, wait: Duration) -> Self {
        self.licenses = Some(licenses);
        self.license_wait = wait;
        self
    }

    fn network_estimate_m(&self, from: (f64, f64), to: (f64, f64)) -> u32 {
        (haversine_m(from, to) * self.circuity).round() as u32
    }
}

impl RoutingEngine for HaversineEngine {
    type Session = HaversineSession;

    fn checkout(&self) -> Result<Self::Session, RoutingError> {
        let license = self
            .licenses
            .as_ref()
            .map(|pool| pool.acquire_timeout(self.license_wait))
            .transpose()?;

        Ok(HaversineSession {
            engine: self.clone(),
            _license: license,
        })
    }
}

/// Session holding an optional license for its lifetime.
#[derive(Debug)]
pub struct HaversineSession {
    engine: HaversineEngine,
    _license: Option<TokenGuard>,
}

impl RoutingSession for HaversineSession {
    fn solve_distances(
        &mut self,
        origins: &[Origin],
        destinations: &[Destination],
        cutoff_m: u32,
    ) -> Result<SolveOutcome, RoutingError> {
        let mut pairs = Vec::new();
        for origin in origins {
            for destination in destinations {
                let distance_m = self
                    .engine
                    .network_estimate_m(origin.location(), destination.location());
                if distance_m <= cutoff_m {
                    pairs.push(SolvedPair {
                        origin_id: origin.id,
                        dest_id: destination.id,
                        distance_m,
                        node_id: None,
                    });
                }
            }
        }
        Ok(SolveOutcome::Solved(pairs))
    }
}
