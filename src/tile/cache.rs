//! Chunk-level LRU cache, byte-bounded.
//!
//! Tiles are never evicted once created, so their staged chunk data would
//! otherwise grow unboundedly over a long session. This cache sits in
//! front of a tile's chunk slot and evicts the least recently used
//! `(level, tile key, chunk index)` entry once the tracked byte budget is
//! exceeded, independent of how many tiles are resident.

use crate::tile::{ChunkKey, TileKey};
use lru::LruCache;
use ndarray::ArrayD;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Identifies one chunk within one tile's pyramid level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkCacheKey {
    pub level: u32,
    pub tile: TileKey,
    pub chunk: ChunkKey,
}

impl ChunkCacheKey {
    pub fn new(level: u32, tile: TileKey, chunk: ChunkKey) -> Self {
        Self { level, tile, chunk }
    }
}

fn array_bytes(arr: &ArrayD<f64>) -> usize {
    arr.len() * std::mem::size_of::<f64>()
}

/// Size-bounded LRU cache of decoded chunk arrays, shared across all tiles.
///
/// A cap on entry count alone (as in a plain `LruCache`) doesn't bound
/// memory: chunks vary in byte size across pyramid levels. This tracks
/// cumulative bytes and evicts oldest-first until back under budget,
/// independent of the `LruCache`'s own entry-count capacity (set generously
/// high so the byte budget is what actually governs eviction).
pub struct ChunkCache {
    entries: Mutex<LruCache<ChunkCacheKey, Arc<ArrayD<f64>>>>,
    max_bytes: usize,
    current_bytes: Mutex<usize>,
}

impl ChunkCache {
    /// Create a cache bounded to `max_bytes` of decoded chunk data.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(usize::MAX).unwrap())),
            max_bytes,
            current_bytes: Mutex::new(0),
        }
    }

    /// Fetch a chunk, marking it most-recently-used.
    pub fn get(&self, key: &ChunkCacheKey) -> Option<Arc<ArrayD<f64>>> {
        self.entries.lock().get(key).cloned()
    }

    /// True without mutating recency (peek, not get).
    pub fn contains(&self, key: &ChunkCacheKey) -> bool {
        self.entries.lock().contains(key)
    }

    /// Insert a chunk, evicting least-recently-used entries until the
    /// byte budget is satisfied.
    pub fn insert(&self, key: ChunkCacheKey, data: Arc<ArrayD<f64>>) {
        let size = array_bytes(&data);
        let mut entries = self.entries.lock();
        let mut bytes = self.current_bytes.lock();

        if let Some(old) = entries.put(key, data) {
            *bytes = bytes.saturating_sub(array_bytes(&old));
        }
        *bytes += size;

        while *bytes > self.max_bytes {
            match entries.pop_lru() {
                Some((_, evicted)) => *bytes = bytes.saturating_sub(array_bytes(&evicted)),
                None => break,
            }
        }
    }

    /// Drop every chunk belonging to `tile` (used when a tile's selector
    /// changes in a way that makes its staged chunks unreachable — the core
    /// itself never calls this since it never evicts proactively, but hosts
    /// wanting tighter memory control can).
    pub fn evict_tile(&self, tile: TileKey) {
        let mut entries = self.entries.lock();
        let mut bytes = self.current_bytes.lock();
        let stale: Vec<ChunkCacheKey> = entries
            .iter()
            .filter(|(k, _)| k.tile == tile)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(data) = entries.pop(&key) {
                *bytes = bytes.saturating_sub(array_bytes(&data));
            }
        }
    }

    /// Current resident size in bytes.
    pub fn size_bytes(&self) -> usize {
        *self.current_bytes.lock()
    }

    /// Number of resident chunks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no chunks are resident.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
