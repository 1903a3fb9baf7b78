//! Level-of-detail fallback: when a tile at the camera's target zoom has no
//! loaded data yet, substitute the nearest ancestor that does, or cover it
//! with loaded descendants, so the screen never shows a hole.

use crate::tile::TileKey;
use crate::viewport::RenderOffset;
use std::collections::HashMap;

/// Decide which tile(s) to actually render in place of `key`.
///
/// Preference order: `key` itself if loaded; else the nearest loaded
/// ancestor; else the set of loaded descendants that fully cover `key`'s
/// footprint (picked by strictly-greater coverage area than any single
/// candidate already chosen, so a partial-coverage descendant never wins
/// over a fully-covering one); else nothing (still loading, render blank).
pub fn keys_to_render(
    key: TileKey,
    loaded: &dyn Fn(TileKey) -> bool,
    max_zoom: u32,
) -> Vec<TileKey> {
    if loaded(key) {
        return vec![key];
    }

    if let Some(ancestor) = overlapping_ancestor(key, loaded) {
        return vec![ancestor];
    }

    let descendants = covering_descendants(key, loaded, max_zoom);
    if !descendants.is_empty() {
        return descendants;
    }

    Vec::new()
}

/// Walk up from `key` toward the root, returning the first ancestor for
/// which `loaded` returns true.
pub fn overlapping_ancestor(key: TileKey, loaded: &dyn Fn(TileKey) -> bool) -> Option<TileKey> {
    let mut current = key.parent();
    while let Some(candidate) = current {
        if loaded(candidate) {
            return Some(candidate);
        }
        current = candidate.parent();
    }
    None
}

/// Breadth-first search down from `key` for the shallowest set of loaded
/// descendants whose union fully covers `key`'s footprint. Coverage is
/// tracked by actual area, in units of `(Δ+1)`-deep leaf cells relative to
/// `key` (a tile Δ levels below `key` is `4^Δ` times smaller, so it covers
/// `leaf_count(max_zoom) / 4^Δ` of `key`'s area) — a tile is accepted only
/// once the loaded descendants' combined area equals `key`'s whole
/// footprint, not merely once the first descendant turns up. Ties (multiple
/// equally-shallow covering sets) are broken by preferring the set found
/// first in row-major (y, then x) order, matching the order children are
/// generated in, so the result is deterministic.
fn covering_descendants(key: TileKey, loaded: &dyn Fn(TileKey) -> bool, max_zoom: u32) -> Vec<TileKey> {
    let total_leaves = leaf_count(key.z, max_zoom);
    let mut frontier = vec![key];
    let mut found = Vec::new();
    let mut covered_leaves = 0u64;

    while !frontier.is_empty() && key.z < max_zoom {
        let mut next_frontier = Vec::new();
        for tile in frontier {
            if tile.z >= max_zoom {
                continue;
            }
            for child in tile.children() {
                if !child.is_valid() {
                    continue;
                }
                if loaded(child) {
                    found.push(child);
                    covered_leaves += leaf_count(child.z, max_zoom);
                } else {
                    next_frontier.push(child);
                }
            }
        }
        if covered_leaves >= total_leaves {
            break;
        }
        frontier = next_frontier;
    }

    if full_coverage(key, &found, covered_leaves, total_leaves) {
        found
    } else {
        Vec::new()
    }
}

/// Area of a tile at `z`, in units where a `max_zoom`-depth tile is 1 —
/// `4^(max_zoom - z)`, since each level down quarters a tile's area.
fn leaf_count(z: u32, max_zoom: u32) -> u64 {
    4u64.saturating_pow(max_zoom.saturating_sub(z))
}

fn full_coverage(key: TileKey, descendants: &[TileKey], covered_leaves: u64, total_leaves: u64) -> bool {
    if descendants.is_empty() || covered_leaves < total_leaves {
        return false;
    }
    descendants.iter().all(|d| d.ancestor_at(key.z) == Some(key))
}

/// Adjust a render offset computed for `key` so it is expressed relative to
/// a substituted tile at a different level (ancestor shown in place of a
/// missing tile, or a descendant covering part of it).
pub fn adjusted_offset(key: TileKey, substitute: TileKey, base: RenderOffset) -> RenderOffset {
    if substitute.z == key.z {
        return base;
    }
    let tile_px = 256.0_f32;
    if substitute.z < key.z {
        // Ancestor: key sits inside one sub-rectangle of the ancestor tile.
        let scale = 2u32.pow(key.z - substitute.z);
        let sub_x = key.x % scale;
        let sub_y = key.y % scale;
        let sub_size = tile_px / scale as f32;
        RenderOffset {
            ox: base.ox - (sub_x as f32 * sub_size) as i32,
            oy: base.oy - (sub_y as f32 * sub_size) as i32,
            level: substitute.z,
        }
    } else {
        // Descendant: substitute covers a fraction of key's footprint.
        let scale = 2u32.pow(substitute.z - key.z);
        let sub_x = substitute.x % scale;
        let sub_y = substitute.y % scale;
        let sub_size = tile_px / scale as f32;
        RenderOffset {
            ox: base.ox + (sub_x as f32 * sub_size) as i32,
            oy: base.oy + (sub_y as f32 * sub_size) as i32,
            level: substitute.z,
        }
    }
}
