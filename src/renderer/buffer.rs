//! Opaque GPU buffer handles and host-agnostic bookkeeping.
//!
//! The engine never allocates a real `wgpu::Buffer` itself — a
//! [`super::GpuBackend`] implementation does that and hands back a
//! [`BufferHandle`]. This module only tracks what was allocated (kind, byte
//! size) so higher layers (grid/dotgrid attribute buffers, the colormap
//! staging buffer) can reason about memory without depending on a concrete
//! GPU API.

use std::collections::HashMap;

/// Opaque reference to a GPU buffer allocated through a [`super::GpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    /// Construct a handle from a backend-assigned id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The backend-assigned id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What a buffer is used for; informs usage flags on the backend side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Per-band instanced attribute data (grid/dotgrid draw modes).
    Attribute,
    /// Index buffer for a fixed-topology quad/point mesh.
    Index,
    /// Per-draw-call uniform data.
    Uniform,
}

/// Bookkeeping for one allocated buffer.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// What the buffer holds.
    pub kind: BufferKind,
    /// Size in bytes.
    pub size_bytes: usize,
}

/// Handle-to-metadata bookkeeping a [`super::GpuBackend`] implementation can
/// reuse; it does not itself own GPU resources.
#[derive(Default)]
pub struct BufferRegistry {
    info: HashMap<BufferHandle, BufferInfo>,
    next_id: u64,
}

impl BufferRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new allocation and return its handle.
    pub fn allocate(&mut self, kind: BufferKind, size_bytes: usize) -> BufferHandle {
        let handle = BufferHandle::new(self.next_id);
        self.next_id += 1;
        self.info.insert(handle, BufferInfo { kind, size_bytes });
        handle
    }

    /// Update the tracked size of an existing buffer (e.g. after a resize-in-place upload).
    pub fn resize(&mut self, handle: BufferHandle, size_bytes: usize) {
        if let Some(info) = self.info.get_mut(&handle) {
            info.size_bytes = size_bytes;
        }
    }

    /// Look up an allocation's metadata.
    pub fn info(&self, handle: BufferHandle) -> Option<&BufferInfo> {
        self.info.get(&handle)
    }

    /// Forget a buffer (the backend is responsible for freeing the real resource).
    pub fn release(&mut self, handle: BufferHandle) {
        self.info.remove(&handle);
    }

    /// Total tracked bytes across all live buffers.
    pub fn total_bytes(&self) -> usize {
        self.info.values().map(|i| i.size_bytes).sum()
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.info.len()
    }

    /// True if no buffers are tracked.
    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_distinct() {
        let mut reg = BufferRegistry::new();
        let a = reg.allocate(BufferKind::Attribute, 64);
        let b = reg.allocate(BufferKind::Attribute, 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_total_bytes_tracks_allocations() {
        let mut reg = BufferRegistry::new();
        reg.allocate(BufferKind::Attribute, 100);
        reg.allocate(BufferKind::Uniform, 48);
        assert_eq!(reg.total_bytes(), 148);
    }

    #[test]
    fn test_release_drops_from_total() {
        let mut reg = BufferRegistry::new();
        let handle = reg.allocate(BufferKind::Index, 32);
        reg.release(handle);
        assert!(reg.info(handle).is_none());
        assert_eq!(reg.total_bytes(), 0);
    }

    #[test]
    fn test_resize_updates_tracked_size() {
        let mut reg = BufferRegistry::new();
        let handle = reg.allocate(BufferKind::Uniform, 16);
        reg.resize(handle, 32);
        assert_eq!(reg.info(handle).unwrap().size_bytes, 32);
    }
}
