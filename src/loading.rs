//! Loading tracker: the engine's single source of truth for whether
//! anything is still in flight, derived from two member sets rather than a
//! bare boolean so overlapping loads don't race each other's clear.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A metadata fetch in flight, identified by pyramid level.
pub type MetadataId = u32;
/// A chunk fetch in flight, identified by `(tile key string, chunk key string)`.
pub type ChunkId = (String, String);

#[derive(Default)]
struct State {
    metadata: HashSet<MetadataId>,
    chunk: HashSet<ChunkId>,
}

/// Tracks in-flight metadata and chunk loads and derives a single `loading`
/// boolean, notifying observers only on actual transitions.
pub struct LoadingTracker {
    state: Mutex<State>,
    on_change: Mutex<Vec<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl Default for LoadingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingTracker {
    /// Create an empty (not loading) tracker.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            on_change: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked whenever the derived `loading` boolean
    /// changes value.
    pub fn on_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.on_change.lock().push(Box::new(callback));
    }

    /// Mark a metadata fetch for `level` as started.
    pub fn set_metadata_loading(&self, level: MetadataId) {
        self.mutate(|s| {
            s.metadata.insert(level);
        });
    }

    /// Mark a metadata fetch for `level` as finished.
    pub fn clear_metadata_loading(&self, level: MetadataId) {
        self.mutate(|s| {
            s.metadata.remove(&level);
        });
    }

    /// Mark a chunk fetch as started.
    pub fn set_chunk_loading(&self, id: ChunkId) {
        self.mutate(|s| {
            s.chunk.insert(id);
        });
    }

    /// Mark a chunk fetch as finished.
    pub fn clear_chunk_loading(&self, id: &ChunkId) {
        self.mutate(|s| {
            s.chunk.remove(id);
        });
    }

    /// Current derived loading state.
    pub fn is_loading(&self) -> bool {
        let s = self.state.lock();
        !s.metadata.is_empty() || !s.chunk.is_empty()
    }

    /// True while any metadata fetch is in flight.
    pub fn is_metadata_loading(&self) -> bool {
        !self.state.lock().metadata.is_empty()
    }

    /// True while any chunk fetch is in flight.
    pub fn is_chunk_loading(&self) -> bool {
        !self.state.lock().chunk.is_empty()
    }

    fn mutate(&self, f: impl FnOnce(&mut State)) {
        let before = self.is_loading();
        {
            let mut s = self.state.lock();
            f(&mut s);
        }
        let after = self.is_loading();
        if before != after {
            for cb in self.on_change.lock().iter() {
                cb(after);
            }
        }
    }
}

/// Shared handle to a [`LoadingTracker`], the shape the engine actually
/// stores and hands to concurrently-spawned load tasks.
pub type SharedLoadingTracker = Arc<LoadingTracker>;
