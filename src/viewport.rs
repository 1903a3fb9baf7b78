//! Viewport resolver: camera + projection + viewport size -> the set of
//! tile keys currently on screen, each with one or more render offsets.

use crate::camera::projection::{CoordinateUtils, Projection, ProjectionType};
use crate::camera::CameraState;
use crate::tile::TileKey;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Where to draw one occurrence of a tile: a world-space pixel offset from
/// the camera-relative origin, plus the pyramid level the offset was
/// computed for (levels can differ across ancestor/descendant substitution
/// in [`crate::lod`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOffset {
    /// X pixel offset.
    pub ox: i32,
    /// Y pixel offset.
    pub oy: i32,
    /// Pyramid level this offset is relative to.
    pub level: u32,
}

/// Horizontal (left/right) or vertical (up/down) draw order hint, used to
/// break ties when two offsets would otherwise overlap on screen.
pub type DrawOrder = (i8, i8);

/// Resolve the tiles active in the current viewport and where to draw each.
pub struct Resolver;

impl Resolver {
    /// Compute the active tile set for one frame.
    ///
    /// `order` biases horizontal wrap-copy enumeration (`-1`/`0`/`1` per
    /// axis) so overlapping world copies draw in a stable, caller-chosen
    /// order rather than hash-map iteration order.
    pub fn active_tiles(
        camera: &CameraState,
        level: u32,
        projection: ProjectionType,
        order: DrawOrder,
    ) -> HashMap<TileKey, SmallVec<[RenderOffset; 9]>> {
        let tile_count = 2_u32.pow(level);
        // spec.md §4.5 step 1: scale = devicePixelRatio * 512 * 2^(zoom - tileZ).
        // Halved here to 256 as this module's base tile size so it lines up
        // with `get_offsets`/`get_lat_based_offsets`'s existing 256px-tile
        // convention; the fractional-zoom and devicePixelRatio factors are
        // unaffected by that choice of base.
        let tile_px = 256.0_f32 * camera.pixel_ratio * 2f32.powf(camera.zoom - level as f32);
        let world_px = tile_px * tile_count as f32;

        let proj: Box<dyn Projection> = match projection {
            ProjectionType::WebMercator => {
                Box::new(crate::camera::projection::WebMercatorProjection::new(world_px))
            }
            ProjectionType::Equirectangular => {
                Box::new(crate::camera::projection::EquirectangularProjection::new(world_px))
            }
        };

        let center_px = proj.project(camera.center.0 as f32, camera.center.1 as f32);
        let (vw, vh) = camera.viewport;
        let half_w = vw as f32 / 2.0;
        let half_h = vh as f32 / 2.0;

        let min_x = center_px.x - half_w;
        let max_x = center_px.x + half_w;
        let min_y = center_px.y - half_h;
        let max_y = center_px.y + half_h;

        let min_tx = (min_x / tile_px).floor() as i64;
        let max_tx = (max_x / tile_px).ceil() as i64;
        let min_ty = (min_y / tile_px).floor() as i64;
        let max_ty = (max_y / tile_px).ceil() as i64;

        let mut active: HashMap<TileKey, SmallVec<[RenderOffset; 9]>> = HashMap::new();

        for ty in min_ty..max_ty {
            if ty < 0 || ty as u32 >= tile_count {
                continue; // no vertical wrap
            }
            for tx in min_tx..max_tx {
                let wrapped_tx = tx.rem_euclid(tile_count as i64) as u32;
                let key = TileKey::new(wrapped_tx, ty as u32, level);
                let ox = (tx as f32 * tile_px - center_px.x) as i32;
                let oy = (ty as f32 * tile_px - center_px.y) as i32;
                let offset = RenderOffset { ox, oy, level };

                let entry = active.entry(key).or_default();
                if !entry.iter().any(|o| *o == offset) {
                    entry.push(offset);
                }
            }
        }

        // `order` only matters for presentation; stabilize iteration by
        // sorting each tile's offsets so horizontal bias is deterministic.
        for offsets in active.values_mut() {
            offsets.sort_by_key(|o| (order.0 as i32 * o.ox, order.1 as i32 * o.oy));
        }

        active
    }

    /// Horizontal wrap-copy x-offsets for a tile column at the given zoom,
    /// covering every world copy visible across `[min_x, max_x]`.
    pub fn get_offsets(min_x: f32, max_x: f32, tile_count: u32) -> Vec<i32> {
        let tile_px = 256.0_f32;
        let world_px = tile_px * tile_count as f32;
        let min_copy = (min_x / world_px).floor() as i32;
        let max_copy = (max_x / world_px).ceil() as i32;
        (min_copy..=max_copy).collect()
    }

    /// Latitude-based vertical offsets: unlike the horizontal axis, the
    /// vertical axis never wraps, so this just clamps to the valid tile
    /// row range and reports the Mercator-space `y` for each row using
    /// [`CoordinateUtils::mercator_y_from_lat`] rather than linear pixel
    /// math, which matters near the poles where Mercator `y` compresses
    /// nonlinearly relative to latitude.
    pub fn get_lat_based_offsets(min_lat: f64, max_lat: f64, tile_count: u32) -> Vec<u32> {
        let min_lat = CoordinateUtils::clamp_lat_mercator(min_lat as f32) as f64;
        let max_lat = CoordinateUtils::clamp_lat_mercator(max_lat as f32) as f64;
        let y_top = CoordinateUtils::mercator_y_from_lat(max_lat);
        let y_bottom = CoordinateUtils::mercator_y_from_lat(min_lat);

        let row_top = (y_top * tile_count as f64).floor().max(0.0) as u32;
        let row_bottom = ((y_bottom * tile_count as f64).ceil() as u32).min(tile_count.saturating_sub(1));

        (row_top..=row_bottom).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::projection::ProjectionType;

    #[test]
    fn test_active_tiles_centered_at_origin() {
        let camera = CameraState::from_explicit((0.0, 0.0), 2.0, (512, 512));
        let active = Resolver::active_tiles(&camera, 2, ProjectionType::WebMercator, (1, 1));
        assert!(!active.is_empty());
        for key in active.keys() {
            assert_eq!(key.z, 2);
            assert!(key.is_valid());
        }
    }

    #[test]
    fn test_active_tiles_no_vertical_wrap() {
        let camera = CameraState::from_explicit((0.0, 85.0), 1.0, (2000, 2000));
        let active = Resolver::active_tiles(&camera, 1, ProjectionType::WebMercator, (1, 1));
        for key in active.keys() {
            assert!(key.y < 2);
        }
    }

    #[test]
    fn test_get_offsets_covers_world_copies() {
        let offsets = Resolver::get_offsets(-300.0, 300.0, 1);
        assert!(offsets.contains(&0));
    }

    #[test]
    fn test_get_lat_based_offsets_within_bounds() {
        let rows = Resolver::get_lat_based_offsets(-10.0, 10.0, 4);
        assert!(rows.iter().all(|r| *r < 4));
    }
}
