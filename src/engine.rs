//! The orchestrator: owns every tile, reacts to camera/selector/uniform
//! updates, decides what to draw each frame, and answers region queries.
//!
//! Everything else in this crate is a leaf the engine wires together —
//! [`crate::viewport::Resolver`] for "what's on screen", [`crate::lod`] for
//! "what do I draw instead if it's not loaded yet", [`crate::tile::Tile`]
//! for "fetch and stage the bytes", and [`crate::region`] for geodesic
//! queries over the same cache. Camera/selector/uniform/draw state changes
//! go through `&mut self` methods called from one logical task runner;
//! tiles use their own interior locking so spawned chunk-load futures can
//! write back without the engine needing to hold a lock across an
//! `.await`. `query_region` is the one `&self` method — its supersession
//! counters are atomics so that two overlapping region queries really can
//! race, matching the "a later query supersedes an earlier one" scenario.

use crate::camera::projection::{CoordinateUtils, Projection, ProjectionType};
use crate::camera::{CameraSource, CameraState};
use crate::chunk::LoaderRegistry;
use crate::error::{MapEngineError, Result};
use crate::lod;
use crate::loading::{LoadingTracker, SharedLoadingTracker};
use crate::metadata::{FillValue, PyramidMetadata};
use crate::region::{self, Region, RegionResult};
use crate::renderer::{
    BandResource, BufferKind, Colormap, DrawPass, DrawUniforms, GpuBackend, Primitive, TextureHandle,
};
use crate::selector::{self, Selector};
use crate::tile::{BandSample, ChunkKey, Tile, TileKey};
use crate::viewport::{DrawOrder, RenderOffset, Resolver};
use ndarray::{ArrayD, IxDyn};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a tile's bands are handed to the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    /// One sampled texture per band.
    Texture,
    /// One instanced point per grid cell, attribute-driven.
    Grid,
    /// Like `Grid`, with a shader-side dot/point-sprite discard radius.
    Dotgrid,
}

impl std::str::FromStr for DrawMode {
    type Err = MapEngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "texture" => Ok(DrawMode::Texture),
            "grid" => Ok(DrawMode::Grid),
            "dotgrid" => Ok(DrawMode::Dotgrid),
            other => Err(MapEngineError::ModeInvalid(format!(
                "unknown draw mode '{other}', expected texture|grid|dotgrid"
            ))),
        }
    }
}

/// Which on-disk pyramid metadata layout produced the [`PyramidMetadata`]
/// passed to [`Engine::construct`]. Recorded only for diagnostics — parsing
/// itself happens in [`crate::metadata`] before construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidVersion {
    /// zarr v2 (`.zattrs`/`.zarray`).
    V2,
    /// zarr v3 (`zarr.json`, possibly sharded).
    V3,
}

/// Camera source for one `update_camera` call: either explicit props or a
/// host [`CameraSource`] (the map library's live view state).
///
/// A host that both wires up a live camera and still passes explicit
/// `center`/`zoom` props must pick one per call: `ViewState` and `Explicit`
/// are mutually exclusive by construction, so there is no shadowing to
/// resolve at call time. `ViewState` is the one to reach for once a map
/// library's camera is attached; `Explicit` suits a host with no such
/// object.
pub enum CameraInput {
    /// Directly supplied center/zoom/viewport, no host camera object.
    Explicit {
        center: (f64, f64),
        zoom: f32,
        viewport: (u32, u32),
        pixel_ratio: f32,
    },
    /// Polled from a live host camera each call.
    ViewState(Box<dyn CameraSource>),
}

/// Construction-time configuration. Callbacks stand in for the original's
/// `setLoading`/`clearLoading`/`invalidate`/`invalidateRegion`/`setMetadata`
/// props — here expressed as plain closures since the engine has no
/// framework context to dispatch through. `on_loading_change` and
/// `on_set_metadata` are registered/invoked once at construction;
/// `on_invalidate`/`on_invalidate_region` fire on every subsequent state
/// change as already documented below.
pub struct EngineConfig {
    /// Draw mode: one texture per band, or an instanced attribute grid.
    pub mode: DrawMode,
    /// Which on-disk metadata layout was parsed, for diagnostics only.
    pub version: PyramidVersion,
    /// Name of the array variable this engine renders.
    pub variable: String,
    /// Initial non-spatial selector.
    pub selector: Selector,
    /// Initial color limits `[min, max]` the shader normalizes samples by.
    pub clim: [f32; 2],
    /// Initial opacity; forced to `0.0` in `draw()` whenever `display` is `false`.
    pub opacity: f32,
    /// Whether the layer renders at all.
    pub display: bool,
    /// Initial colormap; sampled into a 256-entry lookup texture at construction.
    pub colormap: Colormap,
    /// Fill value to discard in the shader; overrides the metadata's own default when set.
    pub fill_value: Option<FillValue>,
    /// Axis orientation; defaults to `(1, 1)` when not given.
    pub order: Option<DrawOrder>,
    /// Projection override; when absent, derived from the metadata's CRS.
    pub projection: Option<ProjectionType>,
    /// Invoked whenever any state change should trigger a redraw.
    pub on_invalidate: Option<Box<dyn Fn() + Send + Sync>>,
    /// Invoked whenever newly loaded data should invalidate an in-flight region query's consumer.
    pub on_invalidate_region: Option<Box<dyn Fn() + Send + Sync>>,
    /// Invoked whenever the derived `metadataLoading`/`chunkLoading`-backed
    /// `loading` boolean transitions, with the new value.
    pub on_loading_change: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// Invoked once at construction with the resolved pyramid metadata.
    pub on_set_metadata: Option<Box<dyn Fn(&PyramidMetadata) + Send + Sync>>,
}

/// Observable lifecycle stage of one tile under the engine's *current*
/// selector — derived from [`Tile`]'s own state, not stored separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileLifecycle {
    /// No chunks loaded or in flight for the current selector's bands.
    Empty,
    /// At least one required chunk is being fetched.
    LoadingChunks,
    /// All required chunks are resident but buffers haven't been (re)sliced yet.
    ChunksReady,
    /// Buffers reflect the current selector.
    BuffersPopulated,
}

fn squeeze_to_2d(arr: &ArrayD<f64>) -> Result<(usize, usize, Vec<f32>)> {
    let shape: Vec<usize> = arr.shape().iter().copied().filter(|&d| d != 1).collect();
    if shape.len() != 2 {
        return Err(MapEngineError::SelectorInvalid(format!(
            "band slice has rank {} after squeezing singleton axes (shape {:?}), expected 2",
            shape.len(),
            arr.shape()
        )));
    }
    let reshaped = arr
        .clone()
        .into_shape(IxDyn(&shape))
        .map_err(|e| MapEngineError::SelectorInvalid(e.to_string()))?;
    let floats: Vec<f32> = reshaped.iter().map(|v| *v as f32).collect();
    Ok((shape[0], shape[1], floats))
}

fn fill_value_to_f32(fill: Option<FillValue>) -> f32 {
    match fill {
        Some(FillValue::Int(i)) => i as f32,
        Some(FillValue::Float(f)) => f as f32,
        None => f32::NAN,
    }
}

fn resolve_projection(explicit: Option<ProjectionType>, crs: &str) -> Result<ProjectionType> {
    if let Some(p) = explicit {
        return Ok(p);
    }
    match crs {
        "EPSG:3857" => Ok(ProjectionType::WebMercator),
        "EPSG:4326" => Ok(ProjectionType::Equirectangular),
        other => Err(MapEngineError::ProjectionInvalid(format!(
            "unknown CRS '{other}' and no projection override supplied"
        ))),
    }
}

fn overlapping_rendered_ancestor(key: TileKey, rendered: &[TileKey]) -> Option<TileKey> {
    rendered
        .iter()
        .copied()
        .find(|r| r.z < key.z && key.ancestor_at(r.z) == Some(*r))
}

/// Owns the tile pyramid, dispatches loads, and produces draw calls.
///
/// Generic over [`GpuBackend`] so the core never names a concrete GPU API —
/// see `renderer::WgpuBackend` for the default implementation.
pub struct Engine<G: GpuBackend> {
    mode: DrawMode,
    version: PyramidVersion,
    variable: String,
    metadata: PyramidMetadata,
    max_zoom: u32,
    loaders: Arc<LoaderRegistry>,
    tiles: HashMap<TileKey, Arc<Tile>>,
    active: HashMap<TileKey, SmallVec<[RenderOffset; 9]>>,
    band_resources: HashMap<TileKey, HashMap<String, BandResource>>,
    camera: CameraState,
    camera_initialized: bool,
    level: u32,
    selector: Selector,
    clim: [f32; 2],
    opacity: f32,
    display: bool,
    fill_value: Option<FillValue>,
    projection: ProjectionType,
    order: DrawOrder,
    custom_uniforms: Vec<(String, f32)>,
    colormap_texture: TextureHandle,
    loading: SharedLoadingTracker,
    query_counter: AtomicU64,
    latest_query_start: AtomicU64,
    on_invalidate: Option<Box<dyn Fn() + Send + Sync>>,
    on_invalidate_region: Option<Box<dyn Fn() + Send + Sync>>,
    gpu: G,
}

impl<G: GpuBackend> Engine<G> {
    /// Construct the engine: allocates one [`Tile`] per `(x, y)` at every
    /// level `0..=max_zoom` (tiles are created once and never destroyed),
    /// resolves the projection, and uploads the initial colormap texture.
    pub fn construct(config: EngineConfig, metadata: PyramidMetadata, loaders: LoaderRegistry, mut gpu: G) -> Result<Self> {
        let projection = resolve_projection(config.projection, &metadata.crs)?;
        let order = config.order.unwrap_or((1, 1));
        let loaders = Arc::new(loaders);
        let max_zoom = metadata.max_zoom;

        let capacity_hint: usize = 1usize << (2 * max_zoom.min(8) as usize);
        let mut tiles = HashMap::with_capacity(capacity_hint);
        for z in 0..=max_zoom {
            let level_meta = metadata.levels.get(&z).ok_or_else(|| {
                MapEngineError::MetadataInvalid(format!("no array metadata for level {z}"))
            })?;
            let chunks_per_dim: Vec<usize> = level_meta
                .shape
                .iter()
                .zip(level_meta.chunk_shape.iter())
                .map(|(s, c)| {
                    let c = (*c).max(1);
                    (*s + c - 1) / c
                })
                .collect();
            let n = 2_u32.pow(z);
            for y in 0..n {
                for x in 0..n {
                    let key = TileKey::new(x, y, z);
                    tiles.insert(
                        key,
                        Arc::new(Tile::new(
                            key,
                            z,
                            level_meta.shape.clone(),
                            chunks_per_dim.clone(),
                            loaders.clone(),
                        )),
                    );
                }
            }
        }

        let colormap_texture = gpu.create_colormap_texture(&config.colormap.sample(256))?;

        let loading = Arc::new(LoadingTracker::new());
        if let Some(cb) = config.on_loading_change {
            loading.on_change(move |v| cb(v));
        }
        if let Some(cb) = &config.on_set_metadata {
            cb(&metadata);
        }

        Ok(Self {
            mode: config.mode,
            version: config.version,
            variable: config.variable,
            metadata,
            max_zoom,
            loaders,
            tiles,
            active: HashMap::new(),
            band_resources: HashMap::new(),
            camera: CameraState::default(),
            camera_initialized: false,
            level: 0,
            selector: config.selector,
            clim: config.clim,
            opacity: config.opacity,
            display: config.display,
            fill_value: config.fill_value,
            projection,
            order,
            custom_uniforms: Vec::new(),
            colormap_texture,
            loading,
            query_counter: AtomicU64::new(0),
            latest_query_start: AtomicU64::new(0),
            on_invalidate: config.on_invalidate,
            on_invalidate_region: config.on_invalidate_region,
            gpu,
        })
    }

    /// The loading tracker observers can subscribe to.
    pub fn loading_tracker(&self) -> SharedLoadingTracker {
        self.loading.clone()
    }

    /// Variable name this engine was constructed for.
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Which on-disk metadata layout this pyramid was read with.
    pub fn version(&self) -> PyramidVersion {
        self.version
    }

    /// Currently resolved pyramid level (`floor(zoom)` clamped to `[0, max_zoom]`).
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Currently active tile set (post-viewport-resolution, pre-LOD-fallback).
    pub fn active(&self) -> &HashMap<TileKey, SmallVec<[RenderOffset; 9]>> {
        &self.active
    }

    // Spatial dimension names; pyramid metadata that omits `_ARRAY_DIMENSIONS`
    // already defaults to this pair in `crate::metadata`, so tile-to-chunk
    // resolution uses the same convention here.
    fn spatial_dims(&self) -> (String, String) {
        ("y".to_string(), "x".to_string())
    }

    fn chunk_shape_for(&self, z: u32) -> &[usize] {
        self.metadata
            .levels
            .get(&z)
            .map(|l| l.chunk_shape.as_slice())
            .unwrap_or(&[])
    }

    fn tile_loaded(&self, key: TileKey) -> bool {
        self.tiles
            .get(&key)
            .map(|t| t.has_populated_buffer(&self.selector))
            .unwrap_or(false)
    }

    /// Lifecycle stage of `key` under the current selector.
    pub fn tile_lifecycle(&self, key: TileKey) -> TileLifecycle {
        let Some(tile) = self.tiles.get(&key) else {
            return TileLifecycle::Empty;
        };
        if tile.has_populated_buffer(&self.selector) {
            return TileLifecycle::BuffersPopulated;
        }
        let spatial = self.spatial_dims();
        let chunk_shape = self.chunk_shape_for(key.z).to_vec();
        let resolved = selector::resolve_bands(
            &self.selector,
            &self.metadata.dimensions,
            &self.metadata.coordinates,
            &chunk_shape,
            (spatial.0.as_str(), spatial.1.as_str()),
            key.x as usize,
            key.y as usize,
        );
        let chunks: Vec<ChunkKey> = resolved.into_values().flat_map(|r| r.chunks).collect();
        if tile.is_loading_chunks(&chunks) {
            TileLifecycle::LoadingChunks
        } else if tile.has_loaded_chunks(&chunks) {
            TileLifecycle::ChunksReady
        } else {
            TileLifecycle::Empty
        }
    }

    /// Recompute the active tile set for `input`, and dispatch loads for any
    /// active tile whose buffer doesn't already match the current selector.
    ///
    /// Every tile's `populate_buffers` future is awaited before this
    /// returns, and each checks its own selector hash after the await — a
    /// concurrent `update_selector` call can't corrupt a buffer write
    /// started under the old selector.
    pub async fn update_camera(&mut self, input: CameraInput) -> Result<()> {
        let (center, zoom, viewport, pixel_ratio) = match input {
            CameraInput::Explicit {
                center,
                zoom,
                viewport,
                pixel_ratio,
            } => (center, zoom, viewport, pixel_ratio),
            CameraInput::ViewState(source) => (
                source.center(),
                source.zoom(),
                source.viewport_size(),
                source.pixel_ratio(),
            ),
        };

        self.camera = CameraState {
            center,
            zoom,
            viewport,
            pixel_ratio,
        };
        self.level = (zoom.floor() as i64).clamp(0, self.max_zoom as i64) as u32;
        self.camera_initialized = true;

        self.active = Resolver::active_tiles(&self.camera, self.level, self.projection, self.order);

        let spatial = self.spatial_dims();
        let selector = self.selector.clone();
        let chunk_shape = self.chunk_shape_for(self.level).to_vec();

        let mut pending = Vec::new();
        for key in self.active.keys().copied().collect::<Vec<_>>() {
            let Some(tile) = self.tiles.get(&key).cloned() else {
                continue;
            };
            if tile.has_populated_buffer(&selector) {
                continue;
            }
            let resolved = selector::resolve_bands(
                &selector,
                &self.metadata.dimensions,
                &self.metadata.coordinates,
                &chunk_shape,
                (spatial.0.as_str(), spatial.1.as_str()),
                key.x as usize,
                key.y as usize,
            );
            let chunks: Vec<ChunkKey> = resolved.into_values().flat_map(|r| r.chunks).collect();
            let selector_for_task = selector.clone();
            self.loading.set_chunk_loading((key.to_string(), "buffers".to_string()));
            pending.push(async move {
                let result = tile.populate_buffers(&chunks, &selector_for_task).await;
                (key, result)
            });
        }

        let results = futures::future::join_all(pending).await;

        let mut any_new = false;
        for (key, result) in results {
            self.loading.clear_chunk_loading(&(key.to_string(), "buffers".to_string()));
            match result {
                Ok(true) => {
                    any_new = true;
                    if let Err(e) = self.rebuild_band_resources(key) {
                        tracing::warn!(tile = %key, error = %e, "failed to build GPU resources for tile");
                    }
                }
                Ok(false) => {
                    // Discarded: either nothing new (buffers already current)
                    // or the selector changed mid-flight. Either way, no-op.
                }
                Err(e) => {
                    tracing::warn!(tile = %key, error = %e, "tile load failed, will retry on next camera update");
                }
            }
        }

        if any_new {
            if let Some(cb) = &self.on_invalidate_region {
                cb();
            }
        }
        if let Some(cb) = &self.on_invalidate {
            cb();
        }
        Ok(())
    }

    fn rebuild_band_resources(&mut self, key: TileKey) -> Result<()> {
        let Some(tile) = self.tiles.get(&key).cloned() else {
            return Ok(());
        };
        let spatial = self.spatial_dims();
        let chunk_shape = self.chunk_shape_for(key.z).to_vec();
        let resolved = selector::resolve_bands(
            &self.selector,
            &self.metadata.dimensions,
            &self.metadata.coordinates,
            &chunk_shape,
            (spatial.0.as_str(), spatial.1.as_str()),
            key.x as usize,
            key.y as usize,
        );
        let mut resources = HashMap::new();
        // A chunk shared by more than one band (e.g. all bands for a tile's
        // spatial dims resolve to the same chunk) is sliced to a 2-D view
        // once and reused, rather than re-squeezing the same array per band.
        let mut slice_cache: HashMap<ChunkKey, Arc<(usize, usize, Vec<f32>)>> = HashMap::new();

        for (name, band) in &resolved {
            let chunk = match band.chunks.as_slice() {
                [single] => single.clone(),
                other => {
                    return Err(MapEngineError::SelectorInvalid(format!(
                        "band '{name}' resolved to {} chunks on tile {key}, expected exactly 1 to build a GPU resource",
                        other.len()
                    )));
                }
            };

            let slice = match slice_cache.get(&chunk) {
                Some(cached) => cached.clone(),
                None => {
                    let data = tile.chunk_data(&chunk).ok_or_else(|| {
                        MapEngineError::SelectorInvalid(format!(
                            "chunk {chunk:?} not resident for band '{name}' on tile {key}"
                        ))
                    })?;
                    let sliced = Arc::new(squeeze_to_2d(&data)?);
                    slice_cache.insert(chunk.clone(), sliced.clone());
                    sliced
                }
            };
            let (h, w, floats) = (slice.0, slice.1, &slice.2);

            let resource = match self.mode {
                DrawMode::Texture => {
                    let handle = self.gpu.create_texture(w as u32, h as u32)?;
                    self.gpu.update_texture(handle, w as u32, h as u32, floats)?;
                    BandResource::Sampler(handle)
                }
                DrawMode::Grid | DrawMode::Dotgrid => {
                    let bytes = bytemuck::cast_slice(floats);
                    let handle = self.gpu.create_buffer(BufferKind::Attribute, bytes)?;
                    BandResource::Attribute(handle)
                }
            };
            resources.insert(name.clone(), resource);
        }

        self.band_resources.insert(key, resources);
        Ok(())
    }

    /// Overwrite the selector. Takes effect lazily: the next `update_camera`
    /// repopulates any tile whose `bufferCache` no longer matches.
    pub fn update_selector(&mut self, selector: Selector) {
        self.selector = selector;
        if let Some(cb) = &self.on_invalidate {
            cb();
        }
    }

    /// Update scalar uniforms. `opacity` is still forced to `0.0` in `draw()`
    /// whenever `display` ends up `false`, regardless of what's passed here.
    pub fn update_uniforms(
        &mut self,
        clim: Option<[f32; 2]>,
        opacity: Option<f32>,
        display: Option<bool>,
        custom: Vec<(String, f32)>,
    ) {
        if let Some(c) = clim {
            self.clim = c;
        }
        if let Some(o) = opacity {
            self.opacity = o;
        }
        if let Some(d) = display {
            self.display = d;
        }
        self.custom_uniforms = custom;
        if let Some(cb) = &self.on_invalidate {
            cb();
        }
    }

    /// Re-sample and re-upload the colormap lookup texture.
    pub fn update_colormap(&mut self, colormap: &Colormap) -> Result<()> {
        self.colormap_texture = self.gpu.create_colormap_texture(&colormap.sample(256))?;
        if let Some(cb) = &self.on_invalidate {
            cb();
        }
        Ok(())
    }

    /// Which (substitute tile, adjusted offset, original active key) triples
    /// to actually draw this frame: `active` run through the LOD fallback
    /// policy, with duplicate substitute+offset pairs and any substitute
    /// already covered by a coarser rendered ancestor suppressed.
    fn get_props(&self) -> Vec<(TileKey, RenderOffset, TileKey)> {
        let loaded = |k: TileKey| self.tile_loaded(k);
        let mut out = Vec::new();
        let mut seen: HashSet<(TileKey, i32, i32, u32)> = HashSet::new();
        let mut rendered_keys: Vec<TileKey> = Vec::new();

        let mut active_keys: Vec<TileKey> = self.active.keys().copied().collect();
        active_keys.sort_by_key(|k| (k.z, k.x, k.y));

        for key in active_keys {
            let offsets = self.active.get(&key).cloned().unwrap_or_default();
            let substitutes = lod::keys_to_render(key, &loaded, self.max_zoom);
            for sub in &substitutes {
                if overlapping_rendered_ancestor(*sub, &rendered_keys).is_some() {
                    continue;
                }
                for offset in &offsets {
                    let adjusted = lod::adjusted_offset(key, *sub, *offset);
                    let dedup = (*sub, adjusted.ox, adjusted.oy, adjusted.level);
                    if !seen.insert(dedup) {
                        continue;
                    }
                    out.push((*sub, adjusted, key));
                }
            }
            rendered_keys.extend(substitutes);
        }

        out
    }

    /// Issue one draw call per resolved (tile, offset) prop. Returns the
    /// number of draw calls submitted.
    pub fn draw(&mut self) -> Result<usize> {
        let opacity = if self.display { self.opacity } else { 0.0 };
        let props = self.get_props();
        let mut submitted = 0;

        for (substitute, offset, _original) in props {
            let Some(bands) = self.band_resources.get(&substitute) else {
                continue;
            };
            let mut band_names: Vec<&String> = bands.keys().collect();
            band_names.sort();
            let resources: Vec<BandResource> = band_names.iter().map(|n| bands[n.as_str()]).collect();
            if resources.is_empty() {
                continue;
            }

            let uniforms = DrawUniforms {
                camera: [self.camera.center.0 as f32, self.camera.center.1 as f32],
                viewport: [self.camera.viewport.0 as f32, self.camera.viewport.1 as f32],
                pixel_ratio: self.camera.pixel_ratio,
                zoom: self.camera.zoom,
                size: self.metadata.tile_size as f32,
                global_level: self.level,
                level: offset.level,
                offset: [offset.ox as f32, offset.oy as f32],
                order: [self.order.0 as f32, self.order.1 as f32],
                projection: match self.projection {
                    ProjectionType::WebMercator => 0,
                    ProjectionType::Equirectangular => 1,
                },
                colormap: self.colormap_texture,
                clim: self.clim,
                opacity,
                fill_value: fill_value_to_f32(self.fill_value),
                center_y: CoordinateUtils::mercator_y_from_lat(self.camera.center.1) as f32,
                custom: self.custom_uniforms.clone(),
            };

            let (vert, frag, primitive, count) = match self.mode {
                DrawMode::Texture => ("tile_vert", "tile_frag_texture", Primitive::TriangleList, 6),
                DrawMode::Grid => (
                    "tile_vert",
                    "tile_frag_grid",
                    Primitive::PointList,
                    (self.metadata.tile_size * self.metadata.tile_size) as u32,
                ),
                DrawMode::Dotgrid => (
                    "tile_vert",
                    "tile_frag_dotgrid",
                    Primitive::PointList,
                    (self.metadata.tile_size * self.metadata.tile_size) as u32,
                ),
            };

            let pass = DrawPass {
                vert,
                frag,
                bands: resources,
                uniforms,
                blend: true,
                depth: false,
                primitive,
                count,
            };
            self.gpu.submit(&pass)?;
            submitted += 1;
        }

        Ok(submitted)
    }

    /// Enumerate the tiles `region` overlaps at the current level, ensure
    /// their chunks are loaded, and sample every pixel inside the circle.
    ///
    /// Returns `None` if a later `query_region` call superseded this one
    /// before its chunk loads resolved (the `queryStart` supersession
    /// check).
    pub async fn query_region(&self, region: &Region) -> Result<Option<RegionResult>> {
        if !self.camera_initialized {
            tracing::warn!("query_region called before the camera was ever set; level defaults to 0");
        }

        let query_start = self.query_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest_query_start.store(query_start, Ordering::SeqCst);

        let tiles = region::tiles_of_region(region, self.level, self.projection);
        let selector = self.selector.clone();
        let spatial = self.spatial_dims();
        let dims = self.metadata.dimensions.clone();
        let chunk_shape = self.chunk_shape_for(self.level).to_vec();

        let mut tile_samples: Vec<(TileKey, Arc<Tile>, Vec<BandSample>, Vec<ChunkKey>)> = Vec::new();
        for key in &tiles {
            if let Some(tile) = self.tiles.get(key).cloned() {
                let resolved = selector::resolve_bands(
                    &selector,
                    &dims,
                    &self.metadata.coordinates,
                    &chunk_shape,
                    (spatial.0.as_str(), spatial.1.as_str()),
                    key.x as usize,
                    key.y as usize,
                );
                let all_chunks: Vec<ChunkKey> = resolved.values().flat_map(|r| r.chunks.clone()).collect();
                // Only bands that resolved to exactly one chunk can be point-sampled;
                // an unconstrained dimension fanning out across several chunks has no
                // single pixel to report here and is skipped.
                let samples: Vec<BandSample> = resolved
                    .into_values()
                    .filter_map(|r| match r.chunks.as_slice() {
                        [single] => Some(BandSample { keys: r.keys, chunk: single.clone() }),
                        _ => None,
                    })
                    .collect();
                tile_samples.push((*key, tile, samples, all_chunks));
            }
        }

        let load_futures = tile_samples.iter().map(|(_, tile, _, chunks)| {
            let tile = tile.clone();
            let chunks = chunks.clone();
            async move { tile.load_chunks(&chunks).await }
        });
        for result in futures::future::join_all(load_futures).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "chunk load failed during region query, affected tile contributes no points");
            }
        }

        if query_start < self.latest_query_start.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let tile_size = self.metadata.tile_size;
        let level = self.level;
        let projection = self.projection;

        let result = region::query(
            region,
            level,
            projection,
            &selector,
            query_start,
            self.latest_query_start.load(Ordering::SeqCst),
            |key| {
                let Some((_, tile, samples, _)) = tile_samples.iter().find(|(k, _, _, _)| *k == key) else {
                    return Vec::new();
                };
                sample_tile_pixels(tile, samples, key, tile_size, projection, level)
            },
            false,
        );
        Ok(result)
    }
}

fn sample_tile_pixels(
    tile: &Tile,
    samples: &[BandSample],
    key: TileKey,
    tile_size: usize,
    projection: ProjectionType,
    level: u32,
) -> Vec<region::RegionPoint> {
    let tile_count = 2_u32.pow(level);
    let world_px = 256.0_f32 * tile_count as f32;
    let proj: Box<dyn Projection> = match projection {
        ProjectionType::WebMercator => {
            Box::new(crate::camera::projection::WebMercatorProjection::new(world_px))
        }
        ProjectionType::Equirectangular => {
            Box::new(crate::camera::projection::EquirectangularProjection::new(world_px))
        }
    };

    let mut points = Vec::with_capacity(tile_size * tile_size);
    for i in 0..tile_size {
        for j in 0..tile_size {
            let values = tile.get_point_values(samples, i, j);
            if values.is_empty() {
                continue;
            }
            let px = key.x as f32 * 256.0 + (j as f32 / tile_size as f32) * 256.0;
            let py = key.y as f32 * 256.0 + (i as f32 / tile_size as f32) * 256.0;
            let geo = proj.unproject(px, py);
            let mut values_map = HashMap::with_capacity(values.len());
            for v in values {
                let label = if v.keys.is_empty() { "default".to_string() } else { v.keys.join("_") };
                values_map.insert(label, v.value);
            }
            points.push(region::RegionPoint {
                lon: geo.x as f64,
                lat: geo.y as f64,
                values: values_map,
            });
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkLoader;
    use crate::metadata::LevelMetadata;
    use crate::renderer::buffer::{BufferHandle, BufferRegistry};
    use crate::renderer::texture::TextureRegistry;
    use async_trait::async_trait;

    struct FakeLoader(f64);

    #[async_trait]
    impl ChunkLoader for FakeLoader {
        async fn load(&self, _chunk: &[usize]) -> Result<ArrayD<f64>> {
            Ok(ArrayD::from_elem(IxDyn(&[4, 4]), self.0))
        }
    }

    /// A loader that signals `started` the moment it's invoked and then
    /// blocks until `release` fires, so a test can pin down exactly when an
    /// in-flight chunk load resolves relative to other queries.
    struct GatedLoader {
        data: f64,
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ChunkLoader for GatedLoader {
        async fn load(&self, _chunk: &[usize]) -> Result<ArrayD<f64>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(ArrayD::from_elem(IxDyn(&[4, 4]), self.data))
        }
    }

    #[derive(Default)]
    struct FakeGpu {
        buffers: BufferRegistry,
        textures: TextureRegistry,
        submits: u32,
    }

    impl GpuBackend for FakeGpu {
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
            self.submits += 1;
            Ok(())
        }
    }

    fn metadata(max_zoom: u32) -> PyramidMetadata {
        let mut levels = HashMap::new();
        for z in 0..=max_zoom {
            levels.insert(
                z,
                LevelMetadata {
                    shape: vec![4, 4],
                    chunk_shape: vec![4, 4],
                },
            );
        }
        PyramidMetadata {
            dimensions: vec!["y".to_string(), "x".to_string()],
            levels,
            max_zoom,
            tile_size: 4,
            crs: "EPSG:3857".to_string(),
            fill_value: None,
            coordinates: HashMap::new(),
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            mode: DrawMode::Texture,
            version: PyramidVersion::V3,
            variable: "temp".to_string(),
            selector: Selector::new(),
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

    fn loaders() -> LoaderRegistry {
        let mut reg = LoaderRegistry::new();
        for level in 0..=3 {
            reg.register(level, Arc::new(FakeLoader(42.0)));
        }
        reg
    }

    #[test]
    fn test_draw_mode_from_str() {
        assert_eq!("texture".parse::<DrawMode>().unwrap(), DrawMode::Texture);
        assert!("bogus".parse::<DrawMode>().is_err());
    }

    #[test]
    fn test_resolve_projection_from_crs() {
        assert_eq!(
            resolve_projection(None, "EPSG:4326").unwrap(),
            ProjectionType::Equirectangular
        );
        assert!(resolve_projection(None, "EPSG:9999").is_err());
    }

    #[tokio::test]
    async fn test_single_tile_camera_at_origin_zoom_zero_draws_once() {
        let engine = Engine::construct(config(), metadata(0), loaders(), FakeGpu::default()).unwrap();
        let mut engine = engine;
        engine
            .update_camera(CameraInput::Explicit {
                center: (0.0, 0.0),
                zoom: 0.0,
                viewport: (256, 256),
                pixel_ratio: 1.0,
            })
            .await
            .unwrap();

        assert!(engine.active.contains_key(&TileKey::new(0, 0, 0)));
        assert!(engine.tile_loaded(TileKey::new(0, 0, 0)));

        let drawn = engine.draw().unwrap();
        assert_eq!(drawn, 1);
        assert_eq!(engine.gpu.submits, 1);
    }

    #[tokio::test]
    async fn test_idempotent_camera_update_does_not_resubmit_loads() {
        let mut engine = Engine::construct(config(), metadata(0), loaders(), FakeGpu::default()).unwrap();
        let input = || CameraInput::Explicit {
            center: (0.0, 0.0),
            zoom: 0.0,
            viewport: (256, 256),
            pixel_ratio: 1.0,
        };
        engine.update_camera(input()).await.unwrap();
        let active_first = engine.active.clone();
        engine.update_camera(input()).await.unwrap();
        assert_eq!(active_first.len(), engine.active.len());
        assert!(engine.tile_loaded(TileKey::new(0, 0, 0)));
    }

    #[tokio::test]
    async fn test_lod_fallback_to_ancestor() {
        // max_zoom 3, but only z=1 ever gets data (loaders for z=0,1 only
        // resolve; z=2,3 loaders are absent so those loads error out and
        // the tile stays empty, matching "transport fault -> tile stays empty").
        let mut reg = LoaderRegistry::new();
        reg.register(0, Arc::new(FakeLoader(1.0)));
        reg.register(1, Arc::new(FakeLoader(2.0)));
        let mut engine = Engine::construct(config(), metadata(3), reg, FakeGpu::default()).unwrap();

        // Force the z=1 ancestor of (0,0,3) to be populated directly.
        engine
            .update_camera(CameraInput::Explicit {
                center: (0.0, 0.0),
                zoom: 1.0,
                viewport: (4, 4),
                pixel_ratio: 1.0,
            })
            .await
            .unwrap();
        assert!(engine.tile_loaded(TileKey::new(0, 0, 1)));

        let loaded = |k: TileKey| engine.tile_loaded(k);
        let result = lod::keys_to_render(TileKey::new(0, 0, 3), &loaded, 3);
        assert_eq!(result, vec![TileKey::new(0, 0, 1)]);
    }

    #[tokio::test]
    async fn test_query_region_returns_result_when_uncontested() {
        let mut engine = Engine::construct(config(), metadata(0), loaders(), FakeGpu::default()).unwrap();
        engine
            .update_camera(CameraInput::Explicit {
                center: (0.0, 0.0),
                zoom: 0.0,
                viewport: (4, 4),
                pixel_ratio: 1.0,
            })
            .await
            .unwrap();

        let region = Region::new((0.0, 0.0), 5000.0, crate::region::DistanceUnit::Kilometers).unwrap();
        let result = engine.query_region(&region).await.unwrap();
        assert!(result.is_some());
    }

    /// An older `query_region` call still waiting on its chunk load must
    /// return `None` once a newer call has claimed a later `queryStart`
    /// before it resolves. Both calls load
    /// the same chunk, so they share one in-flight future; a `GatedLoader`
    /// pins down the exact moment each call claims its `queryStart` relative
    /// to when that shared future resolves, so the outcome doesn't depend on
    /// wall-clock scheduling.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_query_region_supersession() {
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let mut reg = LoaderRegistry::new();
        reg.register(
            0,
            Arc::new(GatedLoader {
                data: 7.0,
                started: started.clone(),
                release: release.clone(),
            }),
        );
        let engine = Arc::new(Engine::construct(config(), metadata(0), reg, FakeGpu::default()).unwrap());
        let region = Region::new((0.0, 0.0), 5000.0, crate::region::DistanceUnit::Kilometers).unwrap();

        let slow = {
            let engine = engine.clone();
            let region = region.clone();
            tokio::spawn(async move { engine.query_region(&region).await.unwrap() })
        };
        // Wait until the slow call has claimed queryStart=1 and is blocked
        // inside the loader, with its in-flight future registered.
        started.notified().await;

        let fast = {
            let engine = engine.clone();
            let region = region.clone();
            tokio::spawn(async move { engine.query_region(&region).await.unwrap() })
        };
        // Give the fast call time to claim queryStart=2 (bumping
        // latest_query_start) and join the same in-flight chunk future.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        release.notify_waiters();

        let slow_result = slow.await.unwrap();
        let fast_result = fast.await.unwrap();
        assert!(slow_result.is_none(), "superseded call must return None");
        assert!(fast_result.is_some(), "latest call must still return a result");
    }

    #[tokio::test]
    async fn test_get_props_suppresses_child_covered_by_ancestor() {
        let mut engine = Engine::construct(config(), metadata(1), loaders(), FakeGpu::default()).unwrap();
        // Populate only the coarser z=0 tile's buffer via the real load path.
        engine
            .update_camera(CameraInput::Explicit {
                center: (0.0, 0.0),
                zoom: 0.0,
                viewport: (4, 4),
                pixel_ratio: 1.0,
            })
            .await
            .unwrap();
        assert!(engine.tile_loaded(TileKey::new(0, 0, 0)));

        // Manually widen `active` to also include an unloaded z=1 child, as
        // if the camera had just zoomed in before that child's load resolved.
        engine.active.insert(
            TileKey::new(0, 0, 1),
            SmallVec::from_vec(vec![RenderOffset { ox: 0, oy: 0, level: 1 }]),
        );

        let props = engine.get_props();
        let substitutes: HashSet<TileKey> = props.iter().map(|(s, _, _)| *s).collect();
        assert!(substitutes.contains(&TileKey::new(0, 0, 0)));
        assert!(!substitutes.contains(&TileKey::new(0, 0, 1)));
    }
}
