//! Partition catalog: origins grouped by spatial cell, destinations indexed
//! per class for proximity lookups.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rstar::primitives::GeomWithData;
use rstar::{AABB, RTree};
use rusqlite::{Connection, OpenFlags};

use crate::config::CatalogConfig;
use crate::error::CatalogError;
use crate::haversine::haversine_m;
use crate::model::{Destination, Origin, PartitionId};
use crate::sql;
use crate::traits::PartitionCatalog;

/// Metres per degree of latitude.
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn new(min_lat: f64, min_lng: f64, max_lat: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            min_lng,
            max_lat,
            max_lng,
        }
    }

    pub fn from_point((lat, lng): (f64, f64)) -> Self {
        Self::new(lat, lng, lat, lng)
    }

    pub fn include(&mut self, (lat, lng): (f64, f64)) {
        self.min_lat = self.min_lat.min(lat);
        self.min_lng = self.min_lng.min(lng);
        self.max_lat = self.max_lat.max(lat);
        self.max_lng = self.max_lng.max(lng);
    }

    /// Great-circle distance from a point to the nearest edge of the box;
    /// zero inside it.
    pub fn distance_m(&self, (lat, lng): (f64, f64)) -> f64 {
        let nearest = (
            lat.clamp(self.min_lat, self.max_lat),
            lng.clamp(self.min_lng, self.max_lng),
        );
        haversine_m(nearest, (lat, lng))
    }

    /// Envelope (lng, lat order) grown by `metres` on every side. The
    /// longitude margin is taken at the latitude furthest from the equator
    /// so the envelope never undershoots.
    fn expanded_envelope(&self, metres: f64) -> AABB<[f64; 2]> {
        let lat_margin = metres / METRES_PER_DEGREE;
        let widest_lat = self.min_lat.abs().max(self.max_lat.abs()) + lat_margin;
        let lng_scale = widest_lat.min(89.0).to_radians().cos().max(0.01);
        let lng_margin = metres / (METRES_PER_DEGREE * lng_scale);
        AABB::from_corners(
            [self.min_lng - lng_margin, self.min_lat - lat_margin],
            [self.max_lng + lng_margin, self.max_lat + lat_margin],
        )
    }
}

#[derive(Debug, Default)]
struct PartitionEntry {
    origins: Vec<Origin>,
    bounds: Option<Bounds>,
}

type IndexedPoint = GeomWithData<[f64; 2], usize>;

#[derive(Debug)]
struct ClassIndex {
    destinations: Vec<Destination>,
    tree: RTree<IndexedPoint>,
}

impl ClassIndex {
    fn build(destinations: Vec<Destination>) -> Self {
        let points = destinations
            .iter()
            .enumerate()
            .map(|(index, destination)| IndexedPoint::new([destination.lng, destination.lat], index))
            .collect();
        Self {
            destinations,
            tree: RTree::bulk_load(points),
        }
    }
}

/// In-memory catalog. Immutable once built, so it can be shared across
/// workers by reference.
#[derive(Debug)]
pub struct MemoryCatalog {
    partitions: BTreeMap<PartitionId, PartitionEntry>,
    classes: HashMap<String, ClassIndex>,
    origin_count: usize,
}

impl MemoryCatalog {
    /// Builds a catalog; partitions are derived from origin membership and
    /// bounded by their origins' extent.
    pub fn new(origins: Vec<Origin>, destinations: Vec<Destination>) -> Self {
        let origin_count = origins.len();
        let mut partitions: BTreeMap<PartitionId, PartitionEntry> = BTreeMap::new();
        for origin in origins {
            partitions.entry(origin.partition).or_default().origins.push(origin);
        }

        let mut by_class: HashMap<String, Vec<Destination>> = HashMap::new();
        for destination in destinations {
            by_class
                .entry(destination.class.clone())
                .or_default()
                .push(destination);
        }

        Self {
            partitions,
            classes: by_class
                .into_iter()
                .map(|(class, destinations)| (class, ClassIndex::build(destinations)))
                .collect(),
            origin_count,
        }
    }

    /// Sets explicit bounds for a partition, registering it if it has no
    /// origins.
    pub fn with_partition_bounds(mut self, partition: PartitionId, bounds: Bounds) -> Self {
        self.partitions.entry(partition).or_default().bounds = Some(bounds);
        self
    }

    /// Loads the catalog from the tables named in `config`.
    pub fn load_sqlite(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let conn = Connection::open_with_flags(
            Path::new(&config.path),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let origins = load_origins(&conn, &config.origin_table)?;
        let destinations = load_destinations(&conn, &config.destination_table)?;
        let mut catalog = Self::new(origins, destinations);

        if let Some(table) = &config.partition_table {
            let mut stmt = conn.prepare(&sql::select_partition_bounds(table))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, PartitionId>(0)?,
                    Bounds::new(row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
                ))
            })?;
            for row in rows {
                let (partition, bounds) = row?;
                catalog = catalog.with_partition_bounds(partition, bounds);
            }
        }

        tracing::info!(
            origins = catalog.origin_count,
            partitions = catalog.partitions.len(),
            classes = catalog.classes.len(),
            "Loaded partition catalog from {}",
            config.path
        );
        Ok(catalog)
    }

    fn bounds_of(&self, partition: PartitionId) -> Result<Option<Bounds>, CatalogError> {
        let entry = self
            .partitions
            .get(&partition)
            .ok_or(CatalogError::UnknownPartition(partition))?;
        if let Some(bounds) = entry.bounds {
            return Ok(Some(bounds));
        }

        let mut locations = entry.origins.iter().map(Origin::location);
        let Some(first) = locations.next() else {
            return Ok(None);
        };
        let mut bounds = Bounds::from_point(first);
        for location in locations {
            bounds.include(location);
        }
        Ok(Some(bounds))
    }
}

impl PartitionCatalog for MemoryCatalog {
    fn list_partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    fn origins_in(&self, partition: PartitionId) -> Result<Vec<Origin>, CatalogError> {
        self.partitions
            .get(&partition)
            .map(|entry| entry.origins.clone())
            .ok_or(CatalogError::UnknownPartition(partition))
    }

    fn destinations_near(
        &self,
        partition: PartitionId,
        class: &str,
        cutoff_m: u32,
    ) -> Result<Vec<Destination>, CatalogError> {
        let Some(bounds) = self.bounds_of(partition)? else {
            return Ok(Vec::new());
        };
        let Some(index) = self.classes.get(class) else {
            return Ok(Vec::new());
        };

        let cutoff = f64::from(cutoff_m);
        let envelope = bounds.expanded_envelope(cutoff);
        let mut near: Vec<Destination> = index
            .tree
            .locate_in_envelope(&envelope)
            .map(|point| &index.destinations[point.data])
            .filter(|destination| bounds.distance_m(destination.location()) <= cutoff)
            .cloned()
            .collect();
        near.sort_by_key(|destination| destination.id);
        Ok(near)
    }

    fn origin_count(&self) -> usize {
        self.origin_count
    }

    fn destination_count(&self, class: &str) -> usize {
        self.classes
            .get(class)
            .map(|index| index.destinations.len())
            .unwrap_or(0)
    }
}

fn check_coordinate(kind: &'static str, id: i64, lat: f64, lng: f64) -> Result<(), CatalogError> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
        Ok(())
    } else {
        Err(CatalogError::InvalidCoordinate { kind, id, lat, lng })
    }
}

fn load_origins(conn: &Connection, table: &str) -> Result<Vec<Origin>, CatalogError> {
    let mut stmt = conn.prepare(&sql::select_origins(table))?;
    let rows = stmt.query_map([], |row| {
        Ok(Origin::new(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })?;

    let mut origins = Vec::new();
    for row in rows {
        let origin = row?;
        check_coordinate("origin", origin.id, origin.lat, origin.lng)?;
        origins.push(origin);
    }
    Ok(origins)
}

fn load_destinations(conn: &Connection, table: &str) -> Result<Vec<Destination>, CatalogError> {
    let mut stmt = conn.prepare(&sql::select_destinations(table))?;
    let rows = stmt.query_map([], |row| {
        Ok(Destination::new(
            row.get(0)?,
            row.get::<_, String>(1)?,
            row.get(2)?,
            row.get(3)?,
        ))
    })?;

    let mut destinations = Vec::new();
    for row in rows {
        let destination = row?;
        check_coordinate("destination", destination.id, destination.lat, destination.lng)?;
        destinations.push(destination);
    }
    Ok(destinations)
}
