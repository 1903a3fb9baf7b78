//! Host-provided chunk transport boundary.
//!
//! The engine never speaks HTTP or talks to an object store directly; it
//! asks a host-registered [`ChunkLoader`] for the raw bytes of one chunk at
//! a time and decodes them into an [`ndarray::ArrayD`]. One loader is
//! registered per pyramid level, since each level is typically a distinct
//! zarr array (and, for sharded stores, a distinct shard index).

use crate::error::Result;
#[cfg(feature = "chunk-cache")]
use crate::tile::cache::{ChunkCache, ChunkCacheKey};
#[cfg(feature = "chunk-cache")]
use crate::tile::TileKey;
use async_trait::async_trait;
use ndarray::ArrayD;
use std::collections::HashMap;
use std::sync::Arc;

/// Fetches and decodes one chunk of one pyramid level.
///
/// Implementations own all I/O (HTTP range requests, object-store reads,
/// local cache lookups) and any chunk-codec decoding (compression, sharding
/// index resolution); this trait's only contract is: given a chunk index,
/// return a decoded N-dimensional array.
#[async_trait]
pub trait ChunkLoader: Send + Sync {
    /// Load and decode the chunk at `chunk_index` (row-major dimension order
    /// matching the array's `chunk_grid`).
    async fn load(&self, chunk_index: &[usize]) -> Result<ArrayD<f64>>;
}

/// Per-level registry of chunk loaders. Stateless beyond the map itself —
/// deduplication of concurrent requests for the same chunk is the
/// responsibility of [`crate::tile::Tile`], not the registry.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: HashMap<u32, Arc<dyn ChunkLoader>>,
}

impl LoaderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Register (or replace) the loader for `level`.
    pub fn register(&mut self, level: u32, loader: Arc<dyn ChunkLoader>) {
        self.loaders.insert(level, loader);
    }

    /// Fetch the loader registered for `level`, if any.
    pub fn get(&self, level: u32) -> Option<Arc<dyn ChunkLoader>> {
        self.loaders.get(&level).cloned()
    }

    /// Number of levels with a registered loader.
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    /// True if no levels have a registered loader.
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

/// Wraps a [`ChunkLoader`] with a byte-bounded [`ChunkCache`] keyed by
/// `(level, tile, chunk index)`.
///
/// Sits *in front of* the transport the host registered, not inside
/// [`crate::tile::Tile`]: a tile's own staged-chunk map must keep the
/// invariant that a chunk key is present iff its load resolved, which a
/// silently evicting cache would violate. Eviction here just means the
/// next `load_chunks` call re-fetches through the wrapped loader instead of
/// paying for unbounded retention — it does not affect tile invariants.
#[cfg(feature = "chunk-cache")]
pub struct CachingChunkLoader {
    level: u32,
    tile: TileKey,
    inner: Arc<dyn ChunkLoader>,
    cache: Arc<ChunkCache>,
}

#[cfg(feature = "chunk-cache")]
impl CachingChunkLoader {
    /// Wrap `inner` for one `(level, tile)`, sharing `cache` across tiles.
    pub fn new(level: u32, tile: TileKey, inner: Arc<dyn ChunkLoader>, cache: Arc<ChunkCache>) -> Self {
        Self {
            level,
            tile,
            inner,
            cache,
        }
    }
}

#[cfg(feature = "chunk-cache")]
#[async_trait]
impl ChunkLoader for CachingChunkLoader {
    async fn load(&self, chunk_index: &[usize]) -> Result<ArrayD<f64>> {
        let key = ChunkCacheKey::new(self.level, self.tile, chunk_index.to_vec());
        if let Some(cached) = self.cache.get(&key) {
            return Ok((*cached).clone());
        }
        let data = self.inner.load(chunk_index).await?;
        self.cache.insert(key, Arc::new(data.clone()));
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeLoader(f64);

    #[async_trait]
    impl ChunkLoader for FakeLoader {
        async fn load(&self, _chunk_index: &[usize]) -> Result<ArrayD<f64>> {
            Ok(ArrayD::from_elem(ndarray::IxDyn(&[2, 2]), self.0))
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_level() {
        let mut registry = LoaderRegistry::new();
        registry.register(0, Arc::new(FakeLoader(1.0)));
        registry.register(1, Arc::new(FakeLoader(2.0)));

        assert_eq!(registry.len(), 2);
        let loader0 = registry.get(0).unwrap();
        let arr = loader0.load(&[0, 0]).await.unwrap();
        assert_eq!(arr[[0, 0]], 1.0);

        assert!(registry.get(5).is_none());
    }

    #[cfg(feature = "chunk-cache")]
    #[tokio::test]
    async fn test_caching_loader_serves_from_cache() {
        use crate::tile::cache::ChunkCache;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingLoader {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ChunkLoader for CountingLoader {
            async fn load(&self, _chunk_index: &[usize]) -> Result<ArrayD<f64>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(ArrayD::from_elem(ndarray::IxDyn(&[2, 2]), 7.0))
            }
        }

        let inner = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ChunkCache::new(1_000_000));
        let loader = CachingChunkLoader::new(0, TileKey::new(0, 0, 0), inner.clone(), cache);

        let first = loader.load(&[0, 0]).await.unwrap();
        let second = loader.load(&[0, 0]).await.unwrap();
        assert_eq!(first[[0, 0]], 7.0);
        assert_eq!(second[[0, 0]], 7.0);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
