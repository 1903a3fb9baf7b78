//! Geodesic circle region queries over the same tile/chunk cache the
//! renderer uses: sample every pixel inside a circle on the ground and
//! report per-band statistics or per-point values.

use crate::camera::projection::{Projection, ProjectionType};
use crate::error::{MapEngineError, Result};
use crate::selector::Selector;
use crate::tile::TileKey;
use geo::{HaversineDestination, HaversineDistance};
use geo_types::Point;
use std::collections::{HashMap, HashSet};

const CIRCLE_VERTICES: usize = 64;

/// Distance unit a region's radius is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceUnit {
    Meters,
    Kilometers,
    Miles,
}

impl DistanceUnit {
    /// Convert a radius in this unit to meters.
    pub fn to_meters(self, value: f64) -> Result<f64> {
        if !value.is_finite() || value <= 0.0 {
            return Err(MapEngineError::UnitsInvalid(format!(
                "radius must be a positive finite number, got {value}"
            )));
        }
        Ok(match self {
            DistanceUnit::Meters => value,
            DistanceUnit::Kilometers => value * 1000.0,
            DistanceUnit::Miles => value * 1609.344,
        })
    }
}

/// A geodesic circle region query.
#[derive(Debug, Clone)]
pub struct Region {
    /// Center in (lon, lat) degrees.
    pub center: (f64, f64),
    /// Radius in `unit`.
    pub radius: f64,
    /// Unit the radius is expressed in.
    pub unit: DistanceUnit,
}

impl Region {
    /// Construct a region, validating the radius/unit combination.
    pub fn new(center: (f64, f64), radius: f64, unit: DistanceUnit) -> Result<Self> {
        unit.to_meters(radius)?;
        Ok(Self { center, radius, unit })
    }

    /// Radius in meters.
    pub fn radius_meters(&self) -> f64 {
        self.unit.to_meters(self.radius).expect("validated at construction")
    }

    /// Build the 64-vertex polygon approximating this circle on the ground,
    /// via evenly-spaced geodesic destination points.
    pub fn polygon(&self) -> Vec<(f64, f64)> {
        let center = Point::new(self.center.0, self.center.1);
        let radius_m = self.radius_meters();
        (0..CIRCLE_VERTICES)
            .map(|i| {
                let bearing = 360.0 * i as f64 / CIRCLE_VERTICES as f64;
                let dest = center.haversine_destination(bearing, radius_m);
                (dest.x(), dest.y())
            })
            .collect()
    }

    /// True if `(lon, lat)` lies within the geodesic circle (not just its
    /// polygon approximation).
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let center = Point::new(self.center.0, self.center.1);
        let point = Point::new(lon, lat);
        center.haversine_distance(&point) <= self.radius_meters()
    }
}

/// One sampled point's per-band values.
#[derive(Debug, Clone)]
pub struct RegionPoint {
    /// Geographic location of the sample.
    pub lon: f64,
    pub lat: f64,
    /// Band name to sampled value (`None` if it was the fill value).
    pub values: HashMap<String, Option<f64>>,
}

/// Result of a region query, either a flat list of sampled points or
/// grouped by tile, depending on what the caller asked for.
#[derive(Debug, Clone)]
pub enum RegionResult {
    /// All sampled points in a single flat list.
    Flat(Vec<RegionPoint>),
    /// Sampled points grouped by the tile they came from.
    Nested(HashMap<TileKey, Vec<RegionPoint>>),
}

/// Enumerate the tiles a region's polygon overlaps at `level`, by walking
/// from the center tile to each polygon vertex's tile along a rhumb line —
/// one tile step per unit of `max(|Δx|, |Δy|)` — and inserting every tile
/// the walk passes through.
///
/// Tile-x wraparound is applied only when a tile is inserted into the
/// result, after the walk's signed deltas are computed; wrapping the
/// center/vertex tiles first (as a naive bounding-box fill would) turns a
/// small circle split across the antimeridian into a near-full tile row,
/// since the wrapped x coordinates land on opposite sides of the grid.
pub fn tiles_of_region(region: &Region, level: u32, projection: ProjectionType) -> HashSet<TileKey> {
    let tile_count = 2_u32.pow(level);
    let proj: Box<dyn Projection> = match projection {
        ProjectionType::WebMercator => {
            Box::new(crate::camera::projection::WebMercatorProjection::new(
                256.0 * tile_count as f32,
            ))
        }
        ProjectionType::Equirectangular => {
            Box::new(crate::camera::projection::EquirectangularProjection::new(
                256.0 * tile_count as f32,
            ))
        }
    };

    // Unwrapped tile coordinates: x can run outside `0..tile_count` while a
    // walk is in progress, wrapped only at insertion time.
    let to_tile_signed = |lon: f64, lat: f64| -> Option<(i64, i64)> {
        let px = proj.project(lon as f32, lat as f32);
        let tx = (px.x / 256.0).floor() as i64;
        let ty = (px.y / 256.0).floor() as i64;
        if ty < 0 || ty as u32 >= tile_count {
            return None;
        }
        Some((tx, ty))
    };

    let mut tiles = HashSet::new();
    let mut insert_wrapped = |tx: i64, ty: i64| {
        if ty < 0 || ty as u32 >= tile_count {
            return;
        }
        let wrapped_tx = tx.rem_euclid(tile_count as i64) as u32;
        tiles.insert(TileKey::new(wrapped_tx, ty as u32, level));
    };

    let Some(center_tile) = to_tile_signed(region.center.0, region.center.1) else {
        return tiles;
    };
    insert_wrapped(center_tile.0, center_tile.1);

    for (lon, lat) in region.polygon() {
        let Some(vertex_tile) = to_tile_signed(lon, lat) else {
            continue;
        };
        let dx = vertex_tile.0 - center_tile.0;
        let dy = vertex_tile.1 - center_tile.1;
        let steps = dx.abs().max(dy.abs()).max(1);
        for step in 0..=steps {
            let t = step as f64 / steps as f64;
            let tx = center_tile.0 + (dx as f64 * t).round() as i64;
            let ty = center_tile.1 + (dy as f64 * t).round() as i64;
            insert_wrapped(tx, ty);
        }
    }

    tiles
}

/// Sample a region against already-resolved per-tile pixel values.
///
/// `sample_tile` is called once per tile in the region with that tile's key
/// and must return sampled `(lon, lat, band -> value)` points already
/// restricted to that tile's footprint; this function performs the final
/// geodesic-circle discard (points inside the bounding polygon but outside
/// the true circle) and result assembly.
pub fn assemble(
    region: &Region,
    tiles: &HashSet<TileKey>,
    sample_tile: impl Fn(TileKey) -> Vec<RegionPoint>,
    nested: bool,
) -> RegionResult {
    if nested {
        let mut grouped = HashMap::new();
        for tile in tiles {
            let points: Vec<RegionPoint> = sample_tile(*tile)
                .into_iter()
                .filter(|p| region.contains(p.lon, p.lat))
                .collect();
            if !points.is_empty() {
                grouped.insert(*tile, points);
            }
        }
        RegionResult::Nested(grouped)
    } else {
        let mut flat = Vec::new();
        for tile in tiles {
            flat.extend(
                sample_tile(*tile)
                    .into_iter()
                    .filter(|p| region.contains(p.lon, p.lat)),
            );
        }
        RegionResult::Flat(flat)
    }
}

/// Query a region against a selector, returning `None` if `query_start`
/// predates the most recent call (a stale, superseded query).
pub fn query(
    region: &Region,
    level: u32,
    projection: ProjectionType,
    _selector: &Selector,
    query_start: u64,
    latest_query_start: u64,
    sample_tile: impl Fn(TileKey) -> Vec<RegionPoint>,
    nested: bool,
) -> Option<RegionResult> {
    if query_start < latest_query_start {
        return None;
    }
    let tiles = tiles_of_region(region, level, projection);
    Some(assemble(region, &tiles, sample_tile, nested))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_radius_rejected() {
        assert!(Region::new((0.0, 0.0), -5.0, DistanceUnit::Meters).is_err());
        assert!(Region::new((0.0, 0.0), f64::NAN, DistanceUnit::Kilometers).is_err());
    }

    #[test]
    fn test_polygon_has_64_vertices() {
        let region = Region::new((-122.4, 37.7), 5.0, DistanceUnit::Kilometers).unwrap();
        assert_eq!(region.polygon().len(), 64);
    }

    #[test]
    fn test_contains_center_and_excludes_far_point() {
        let region = Region::new((0.0, 0.0), 10.0, DistanceUnit::Kilometers).unwrap();
        assert!(region.contains(0.0, 0.0));
        assert!(!region.contains(10.0, 10.0));
    }

    #[test]
    fn test_tiles_of_region_includes_center() {
        let region = Region::new((0.0, 0.0), 50.0, DistanceUnit::Kilometers).unwrap();
        let tiles = tiles_of_region(&region, 4, ProjectionType::WebMercator);
        assert!(!tiles.is_empty());
    }

    #[test]
    fn test_query_rejects_stale() {
        let region = Region::new((0.0, 0.0), 10.0, DistanceUnit::Kilometers).unwrap();
        let selector = Selector::new();
        let result = query(
            &region,
            2,
            ProjectionType::WebMercator,
            &selector,
            1,
            5,
            |_| Vec::new(),
            false,
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_assemble_nested_groups_by_tile() {
        let region = Region::new((0.0, 0.0), 500.0, DistanceUnit::Kilometers).unwrap();
        let tiles: HashSet<TileKey> = [TileKey::new(0, 0, 1)].into_iter().collect();
        let result = assemble(
            &region,
            &tiles,
            |_| {
                vec![RegionPoint {
                    lon: 0.0,
                    lat: 0.0,
                    values: HashMap::new(),
                }]
            },
            true,
        );
        match result {
            RegionResult::Nested(map) => assert_eq!(map.len(), 1),
            _ => panic!("expected nested result"),
        }
    }
}
