//! End-to-end tests driving `Engine` through its public API only, with an
//! in-memory chunk loader and GPU backend standing in for real transport
//! and a real graphics device.

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use pyramid_engine::metadata::LevelMetadata;
use pyramid_engine::prelude::*;
use pyramid_engine::region::DistanceUnit;
use pyramid_engine::renderer::buffer::BufferRegistry;
use pyramid_engine::renderer::texture::TextureRegistry;
use pyramid_engine::renderer::{BufferHandle, BufferKind, DrawPass, TextureHandle};
use pyramid_engine::selector::ScalarValue;
use pyramid_engine::{RegionResult, SelectorValue, TileKey};
use std::collections::HashMap;
use std::sync::Arc;

struct ConstantLoader(f64);

#[async_trait]
impl ChunkLoader for ConstantLoader {
    async fn load(&self, _chunk: &[usize]) -> Result<ArrayD<f64>> {
        Ok(ArrayD::from_elem(IxDyn(&[8, 8]), self.0))
    }
}

#[derive(Default)]
struct InMemoryGpu {
    buffers: BufferRegistry,
    textures: TextureRegistry,
}

impl GpuBackend for InMemoryGpu {
    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferHandle> {
        Ok(self.buffers.allocate(kind, data.len()))
    }
    fn update_buffer(&mut self, _handle: BufferHandle, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn destroy_buffer(&mut self, handle: BufferHandle) {
        self.buffers.release(handle);
    }
    fn create_texture(&mut self, w: u32, h: u32) -> Result<TextureHandle> {
        Ok(self.textures.allocate(w, h))
    }
    fn update_texture(&mut self, _handle: TextureHandle, _w: u32, _h: u32, _data: &[f32]) -> Result<()> {
        Ok(())
    }
    fn destroy_texture(&mut self, handle: TextureHandle) {
        self.textures.release(handle);
    }
    fn create_colormap_texture(&mut self, samples: &[[f32; 4]]) -> Result<TextureHandle> {
        Ok(self.textures.allocate(samples.len() as u32, 1))
    }
    fn submit(&mut self, _pass: &DrawPass) -> Result<()> {
        Ok(())
    }
}

fn metadata_at(max_zoom: u32, tile_size: usize) -> PyramidMetadata {
    metadata_with_time(max_zoom, tile_size, &[])
}

/// Same as `metadata_at`, but with a `time` dimension whose coordinate
/// array is `time_coords` (chunked one coordinate per chunk) appended after
/// the spatial dims, so selector tests can exercise real non-spatial chunk
/// resolution instead of a dimension that's never in `dimensions`.
fn metadata_with_time(max_zoom: u32, tile_size: usize, time_coords: &[f64]) -> PyramidMetadata {
    let mut levels = HashMap::new();
    for z in 0..=max_zoom {
        let n = tile_size << z;
        let (shape, chunk_shape) = if time_coords.is_empty() {
            (vec![n, n], vec![tile_size, tile_size])
        } else {
            (vec![time_coords.len(), n, n], vec![1, tile_size, tile_size])
        };
        levels.insert(z, LevelMetadata { shape, chunk_shape });
    }
    let dimensions = if time_coords.is_empty() {
        vec!["y".to_string(), "x".to_string()]
    } else {
        vec!["time".to_string(), "y".to_string(), "x".to_string()]
    };
    let mut coordinates = HashMap::new();
    if !time_coords.is_empty() {
        coordinates.insert(
            "time".to_string(),
            pyramid_engine::selector::CoordinateAxis {
                values: time_coords.iter().map(|v| ScalarValue::Number(*v)).collect(),
            },
        );
    }
    PyramidMetadata {
        dimensions,
        levels,
        max_zoom,
        tile_size,
        crs: "EPSG:3857".to_string(),
        fill_value: None,
        coordinates,
    }
}

fn config_with_selector(selector: Selector) -> EngineConfig {
    EngineConfig {
        mode: DrawMode::Texture,
        version: PyramidVersion::V3,
        variable: "temperature".to_string(),
        selector,
        clim: [0.0, 1.0],
        opacity: 1.0,
        display: true,
        colormap: Colormap::from_rgba_stops(vec![[0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]]),
        fill_value: None,
        order: None,
        projection: None,
        on_invalidate: None,
        on_invalidate_region: None,
        on_loading_change: None,
        on_set_metadata: None,
    }
}

fn loaders_for(max_zoom: u32) -> LoaderRegistry {
    let mut reg = LoaderRegistry::new();
    for level in 0..=max_zoom {
        reg.register(level, Arc::new(ConstantLoader(3.0)));
    }
    reg
}

/// Camera straddling the antimeridian at zoom 2 must produce active tile
/// keys that wrap around the world rather than falling off the edge of the
/// tile grid, with each wrapped key carrying a render offset that
/// reconstructs a single continuous strip of world space.
#[tokio::test]
async fn test_camera_straddling_antimeridian_wraps_active_tiles() {
    let mut engine = Engine::construct(
        config_with_selector(Selector::new()),
        metadata_at(2, 8),
        loaders_for(2),
        InMemoryGpu::default(),
    )
    .unwrap();

    engine
        .update_camera(CameraInput::Explicit {
            center: (180.0, 0.0),
            zoom: 2.0,
            viewport: (1024, 512),
            pixel_ratio: 1.0,
        })
        .await
        .unwrap();

    let active = engine.active();
    assert!(!active.is_empty());

    let xs: std::collections::HashSet<u32> = active.keys().map(|k| k.x).collect();
    assert!(xs.len() > 1, "a viewport straddling the antimeridian must touch more than one tile column, got {xs:?}");
    for key in active.keys() {
        assert_eq!(key.z, 2);
        assert!(key.x < 4, "wrapped tile x must stay within the zoom-2 grid, got {}", key.x);
    }

    // Every occurrence of every tile must carry at least one render offset,
    // and tiles straddling the seam should carry world-wrapped copies whose
    // offsets differ by a multiple of the world width.
    for offsets in active.values() {
        assert!(!offsets.is_empty());
    }
}

/// A list-valued selector dimension expands into one band per list entry;
/// narrowing the selector back to a scalar must re-enter load-then-populate
/// for the new band while leaving the tile's prior buffers in place (they
/// are not proactively evicted, just no longer what gets rebuilt).
#[tokio::test]
async fn test_selector_band_expansion_and_reentry_on_change() {
    let mut selector = Selector::new();
    selector.insert(
        "time".to_string(),
        SelectorValue::List(vec![ScalarValue::Number(2020.0), ScalarValue::Number(2021.0)]),
    );

    let mut engine = Engine::construct(
        config_with_selector(selector),
        metadata_with_time(0, 8, &[2020.0, 2021.0, 2022.0]),
        loaders_for(0),
        InMemoryGpu::default(),
    )
    .unwrap();

    engine
        .update_camera(CameraInput::Explicit {
            center: (0.0, 0.0),
            zoom: 0.0,
            viewport: (8, 8),
            pixel_ratio: 1.0,
        })
        .await
        .unwrap();

    let key = TileKey::new(0, 0, 0);
    assert!(engine.tile_loaded(key));

    let mut narrowed = Selector::new();
    narrowed.insert(
        "time".to_string(),
        SelectorValue::Scalar(ScalarValue::Number(2022.0)),
    );
    engine.update_selector(narrowed);

    // The tile's buffers no longer match the new selector until the next
    // camera update repopulates them.
    assert!(!engine.tile_loaded(key));

    engine
        .update_camera(CameraInput::Explicit {
            center: (0.0, 0.0),
            zoom: 0.0,
            viewport: (8, 8),
            pixel_ratio: 1.0,
        })
        .await
        .unwrap();

    assert!(engine.tile_loaded(key));
}

/// A 1km circle at the origin, at a zoom level where a pixel covers far
/// less ground than that, must return a non-empty set of sampled points, all
/// genuinely within the circle.
#[tokio::test]
async fn test_region_query_returns_points_within_radius() {
    let mut engine = Engine::construct(
        config_with_selector(Selector::new()),
        metadata_at(10, 8),
        loaders_for(10),
        InMemoryGpu::default(),
    )
    .unwrap();

    engine
        .update_camera(CameraInput::Explicit {
            center: (0.0, 0.0),
            zoom: 10.0,
            viewport: (64, 64),
            pixel_ratio: 1.0,
        })
        .await
        .unwrap();

    let region = Region::new((0.0, 0.0), 1.0, DistanceUnit::Kilometers).unwrap();
    let result = engine.query_region(&region).await.unwrap();
    let result = result.expect("uncontested query must return a result");

    let RegionResult::Flat(points) = result else {
        panic!("expected a flat region result");
    };

    assert!(!points.is_empty());
    for point in &points {
        assert!(
            region.contains(point.lon, point.lat),
            "point ({}, {}) outside the queried circle",
            point.lon,
            point.lat
        );
    }
}

/// Pyramid metadata with no `multiscales` entry must fail construction with
/// a fatal, non-recoverable error rather than a generic parse error.
#[test]
fn test_missing_multiscales_rejects_with_metadata_invalid() {
    let zattrs = br#"{"some_other_key": 1}"#;
    let err = pyramid_engine::metadata::parse_v2(zattrs, &[], &[]).unwrap_err();

    assert!(matches!(err, MapEngineError::MetadataInvalid(_)));
    assert!(err.is_fatal());
    assert!(!err.is_recoverable());
}
