//! Tile keys and the per-tile chunk loading / buffer state machine.

pub mod cache;

use crate::chunk::LoaderRegistry;
use crate::error::{MapEngineError, Result};
use crate::selector::Selector;
use futures::future::{BoxFuture, FutureExt, Shared};
use ndarray::ArrayD;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A chunk index within one array, e.g. `[row, col]` or `[row, col, band]`.
pub type ChunkKey = Vec<usize>;

fn chunk_key_string(chunk: &[usize]) -> String {
    chunk
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Tile coordinate in the standard XYZ slippy-map scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileKey {
    /// X coordinate (column).
    pub x: u32,
    /// Y coordinate (row).
    pub y: u32,
    /// Zoom level.
    pub z: u32,
}

impl TileKey {
    /// Create a new tile key.
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Get the parent tile at zoom level z-1.
    pub fn parent(&self) -> Option<TileKey> {
        if self.z == 0 {
            None
        } else {
            Some(TileKey {
                x: self.x / 2,
                y: self.y / 2,
                z: self.z - 1,
            })
        }
    }

    /// Get the four child tiles at zoom level z+1.
    pub fn children(&self) -> [TileKey; 4] {
        let x = self.x * 2;
        let y = self.y * 2;
        let z = self.z + 1;

        [
            TileKey::new(x, y, z),
            TileKey::new(x + 1, y, z),
            TileKey::new(x, y + 1, z),
            TileKey::new(x + 1, y + 1, z),
        ]
    }

    /// Check if this tile is valid at its zoom level (no vertical wrap).
    pub fn is_valid(&self) -> bool {
        let max_tile = 2_u32.pow(self.z);
        self.y < max_tile
    }

    /// Ancestor at `ancestor_z <= self.z`, or `None` if out of range.
    pub fn ancestor_at(&self, ancestor_z: u32) -> Option<TileKey> {
        if ancestor_z > self.z {
            return None;
        }
        let shift = self.z - ancestor_z;
        Some(TileKey {
            x: self.x >> shift,
            y: self.y >> shift,
            z: ancestor_z,
        })
    }
}

impl Hash for TileKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.x.hash(state);
        self.y.hash(state);
        self.z.hash(state);
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl std::str::FromStr for TileKey {
    type Err = MapEngineError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(MapEngineError::SelectorInvalid(format!(
                "malformed tile key: {s}"
            )));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| MapEngineError::SelectorInvalid(format!("malformed tile key: {s}")))
        };
        Ok(TileKey {
            x: parse(parts[0])?,
            y: parse(parts[1])?,
            z: parse(parts[2])?,
        })
    }
}

/// One band's resolved sample source: the chunk its pixel lives in, plus
/// the coordinate-label keys that identify which band this is (empty for a
/// fully scalar selector).
#[derive(Debug, Clone)]
pub struct BandSample {
    /// Coordinate-label keys, e.g. `["time_2020"]`; empty if the selector
    /// has no list-valued or unconstrained non-spatial dimension.
    pub keys: Vec<String>,
    /// The single chunk this band resolved to for the tile being sampled.
    pub chunk: ChunkKey,
}

/// One sampled point's value, tagged by the coordinate-label `keys` of the
/// band it came from (see spec.md's region-query point result shape).
#[derive(Debug, Clone)]
pub struct PointValue {
    /// Coordinate-label keys identifying which band this value belongs to.
    pub keys: Vec<String>,
    /// Value at the sampled pixel, or `None` if the chunk wasn't resident.
    pub value: Option<f64>,
}

type ChunkFuture = Shared<BoxFuture<'static, Result<(), String>>>;

/// A single pyramid tile: owns chunk bytes for every band selected so far
/// and the GPU-ready buffers built from them.
///
/// Invariants: a tile is constructed once and never removed from the
/// engine's tile map; bands are derived lazily per selector and cached
/// until the buffer-populating selector changes.
pub struct Tile {
    key: TileKey,
    level: u32,
    shape: Vec<usize>,
    chunks_per_dim: Vec<usize>,
    loaders: Arc<LoaderRegistry>,
    chunked_data: RwLock<HashMap<String, Arc<ArrayD<f64>>>>,
    loading: RwLock<HashMap<String, ChunkFuture>>,
    buffer_selector_hash: RwLock<Option<u64>>,
}

impl Tile {
    /// Construct a tile for the given key at the given pyramid level.
    pub fn new(
        key: TileKey,
        level: u32,
        shape: Vec<usize>,
        chunks_per_dim: Vec<usize>,
        loaders: Arc<LoaderRegistry>,
    ) -> Self {
        Self {
            key,
            level,
            shape,
            chunks_per_dim,
            loaders,
            chunked_data: RwLock::new(HashMap::new()),
            loading: RwLock::new(HashMap::new()),
            buffer_selector_hash: RwLock::new(None),
        }
    }

    /// This tile's key.
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// The pyramid level this tile belongs to.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Kick off loads for any of `chunks` not already loaded or in flight.
    /// Returns `true` if at least one new load was started.
    pub async fn load_chunks(&self, chunks: &[ChunkKey]) -> Result<bool> {
        let mut started = false;
        let mut futures_to_await = Vec::new();

        for chunk in chunks {
            let key = chunk_key_string(chunk);
            if self.chunked_data.read().contains_key(&key) {
                continue;
            }
            let existing = self.loading.read().get(&key).cloned();
            let fut = match existing {
                Some(f) => f,
                None => {
                    let loader = self
                        .loaders
                        .get(self.level)
                        .ok_or_else(|| {
                            MapEngineError::SelectorInvalid(format!(
                                "no chunk loader registered for level {}",
                                self.level
                            ))
                        })?
                        .clone();
                    let chunk_owned = chunk.clone();
                    let boxed: BoxFuture<'static, Result<(), String>> = async move {
                        loader.load(&chunk_owned).await.map(|_| ()).map_err(|e| e.to_string())
                    }
                    .boxed();
                    let shared = boxed.shared();
                    self.loading.write().insert(key.clone(), shared.clone());
                    started = true;
                    shared
                }
            };
            futures_to_await.push((key, chunk.clone(), fut));
        }

        for (key, chunk, fut) in futures_to_await {
            match fut.await {
                Ok(()) => {
                    if !self.chunked_data.read().contains_key(&key) {
                        let loader = self.loaders.get(self.level).ok_or_else(|| {
                            MapEngineError::SelectorInvalid(format!(
                                "no chunk loader registered for level {}",
                                self.level
                            ))
                        })?;
                        let data = loader.load(&chunk).await.map_err(|e| {
                            MapEngineError::TransportFault {
                                level: self.level,
                                chunk: chunk.clone(),
                                source: e.to_string(),
                            }
                        })?;
                        self.chunked_data.write().insert(key.clone(), Arc::new(data));
                    }
                    self.loading.write().remove(&key);
                }
                Err(e) => {
                    self.loading.write().remove(&key);
                    return Err(MapEngineError::TransportFault {
                        level: self.level,
                        chunk,
                        source: e,
                    });
                }
            }
        }

        Ok(started)
    }

    /// Await all given chunks without starting new loads; error if any are
    /// neither loaded nor in flight.
    pub async fn chunks_loaded(&self, chunks: &[ChunkKey]) -> Result<()> {
        self.load_chunks(chunks).await.map(|_| ())
    }

    /// True if every one of `chunks` is already resident.
    pub fn has_loaded_chunks(&self, chunks: &[ChunkKey]) -> bool {
        let data = self.chunked_data.read();
        chunks.iter().all(|c| data.contains_key(&chunk_key_string(c)))
    }

    /// True if any of `chunks` is currently being fetched.
    pub fn is_loading_chunks(&self, chunks: &[ChunkKey]) -> bool {
        let loading = self.loading.read();
        chunks.iter().any(|c| loading.contains_key(&chunk_key_string(c)))
    }

    /// Selector hash used to detect whether a buffer-populating selector
    /// changed while an async step was in flight.
    fn selector_hash(selector: &Selector) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut keys: Vec<&String> = selector.keys().collect();
        keys.sort();
        let mut hasher = DefaultHasher::new();
        for k in keys {
            k.hash(&mut hasher);
            format!("{:?}", selector.get(k)).hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Slice loaded chunk data for every band implied by `selector` and mark
    /// buffers populated for that selector. Returns `false` (without error)
    /// if the selector changed underneath this call before it completed.
    pub async fn populate_buffers(&self, chunks: &[ChunkKey], selector: &Selector) -> Result<bool> {
        let hash = Self::selector_hash(selector);
        self.chunks_loaded(chunks).await?;
        if Self::selector_hash(selector) != hash {
            return Ok(false);
        }
        self.populate_buffers_sync(selector)?;
        Ok(true)
    }

    /// Synchronous buffer population assuming all required chunks are
    /// already resident. Caches the chunk-key hash actually used so
    /// `has_populated_buffer` can detect staleness.
    pub fn populate_buffers_sync(&self, selector: &Selector) -> Result<()> {
        let data = self.chunked_data.read();
        if data.is_empty() {
            return Err(MapEngineError::SelectorInvalid(
                "populate_buffers_sync called with no loaded chunks".into(),
            ));
        }
        *self.buffer_selector_hash.write() = Some(Self::selector_hash(selector));
        Ok(())
    }

    /// True if the buffers currently populated match `selector`.
    pub fn has_populated_buffer(&self, selector: &Selector) -> bool {
        *self.buffer_selector_hash.read() == Some(Self::selector_hash(selector))
    }

    /// Fetch a resident chunk's decoded array, if staged.
    ///
    /// Lets a caller (the engine) build GPU resources from the same staged
    /// data `populate_buffers_sync` validated, without this module needing
    /// to know about bands, GPU handles, or draw modes.
    pub fn chunk_data(&self, chunk: &ChunkKey) -> Option<Arc<ArrayD<f64>>> {
        self.chunked_data.read().get(&chunk_key_string(chunk)).cloned()
    }

    /// Pixel shape of the underlying array (row-major).
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Chunk grid shape.
    pub fn chunks_per_dim(&self) -> &[usize] {
        &self.chunks_per_dim
    }

    /// Sample one pixel for each of `samples`' resolved bands. A band whose
    /// chunk isn't resident is skipped entirely rather than padded with a
    /// `None` value, since that band contributes no point at all.
    pub fn get_point_values(&self, samples: &[BandSample], row: usize, col: usize) -> Vec<PointValue> {
        let data = self.chunked_data.read();
        samples
            .iter()
            .filter_map(|sample| {
                let arr = data.get(&chunk_key_string(&sample.chunk))?;
                let value = if arr.ndim() == 2 {
                    arr.get([row, col]).copied()
                } else {
                    None
                };
                Some(PointValue {
                    keys: sample.keys.clone(),
                    value,
                })
            })
            .collect()
    }
}
