//! Melbourne CBD and Geelong landmarks for test fixtures.
//!
//! Coordinates sourced from OpenStreetMap. They are routable with the
//! Geofabrik `australia-oceania/australia` extract.

/// A named location with coordinates.
#[derive(Debug, Clone)]
pub struct Location {
    pub name: &'static str,
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub const fn new(name: &'static str, lat: f64, lng: f64) -> Self {
        Self { name, lat, lng }
    }

    pub fn coords(&self) -> (f64, f64) {
        (self.lat, self.lng)
    }
}

// ============================================================================
// Supermarkets around the CBD
// ============================================================================

pub const SUPERMARKETS: &[Location] = &[
    Location::new("Queen Victoria Market", -37.8076, 144.9568),
    Location::new("Melbourne Central", -37.8102, 144.9628),
    Location::new("Southern Cross Station", -37.8184, 144.9525),
];

// ============================================================================
// Parks around the CBD
// ============================================================================

pub const PARKS: &[Location] = &[
    Location::new("Flagstaff Gardens", -37.8107, 144.9545),
    Location::new("Carlton Gardens", -37.8060, 144.9717),
    Location::new("Fitzroy Gardens", -37.8131, 144.9800),
    Location::new("Treasury Gardens", -37.8145, 144.9760),
];

// ============================================================================
// Tram stops on Swanston Street
// ============================================================================

pub const TRAM_STOPS: &[Location] = &[
    Location::new("Melbourne Central / Swanston St", -37.8100, 144.9638),
    Location::new("Bourke St Mall / Swanston St", -37.8136, 144.9651),
    Location::new("Town Hall / Swanston St", -37.8152, 144.9664),
];

/// Origin anchor in the middle of the CBD grid.
pub const STATE_LIBRARY: Location = Location::new("State Library Victoria", -37.8098, 144.9652);

/// Origin anchor on the park side of the CBD.
pub const PARLIAMENT_STATION: Location = Location::new("Parliament Station", -37.8111, 144.9728);

/// Origin anchor far from every CBD destination.
pub const GEELONG_WATERFRONT: Location = Location::new("Geelong Waterfront", -38.1436, 144.3614);

/// Returns `count` points stepping east from `anchor` by about `step_m`
/// metres each.
pub fn east_of(anchor: &Location, count: usize, step_m: f64) -> Vec<(f64, f64)> {
    let metres_per_degree_lng = 111_320.0 * anchor.lat.to_radians().cos();
    (0..count)
        .map(|index| {
            (
                anchor.lat,
                anchor.lng + index as f64 * step_m / metres_per_degree_lng,
            )
        })
        .collect()
}
