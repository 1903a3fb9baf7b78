//! GPU draw-call boundary consumed by the engine.
//!
//! The core never opens a device or compiles a shader itself — it hands a
//! [`DrawPass`] per tile per frame to whatever [`GpuBackend`] the host wired
//! up, and the backend is the thing that knows `wgpu` (or WebGL, or
//! anything else). [`DrawPass`] mirrors the shader's uniform/attribute
//! contract exactly: vert/frag identifiers, per-band samplers or instanced
//! attributes, the fixed uniform set every draw needs, and the
//! blend/depth/primitive/count fixed-function state.

pub mod buffer;
pub mod texture;

use crate::error::Result;
pub use buffer::{BufferHandle, BufferKind};
pub use texture::{Colormap, TextureHandle};

/// Primitive topology a draw call assembles vertices into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// Two triangles per tile quad (texture draw mode).
    TriangleList,
    /// A screen-aligned quad strip.
    TriangleStrip,
    /// One point per grid cell (grid/dotgrid draw modes).
    PointList,
}

/// Per-band GPU resource a tile hands the renderer: a sampler in texture
/// draw mode, an instanced vertex attribute buffer in grid/dotgrid mode.
#[derive(Debug, Clone, Copy)]
pub enum BandResource {
    /// A single-channel float texture sampled per-fragment.
    Sampler(TextureHandle),
    /// A per-instance attribute buffer, one value per grid cell.
    Attribute(BufferHandle),
}

/// The scalar uniform set a shader contract guarantees every draw call:
/// camera/viewport state, the active pyramid level versus the globally
/// resolved level (for LOD offset correction), per-tile render offset and
/// draw order, the projection mode, and the colormap/`clim`/fill-value
/// triple that turns a sampled scalar into a color. `custom` carries
/// anything a host passed through `updateUniforms` that has no fixed slot.
#[derive(Debug, Clone)]
pub struct DrawUniforms {
    pub camera: [f32; 2],
    pub viewport: [f32; 2],
    pub pixel_ratio: f32,
    pub zoom: f32,
    pub size: f32,
    pub global_level: u32,
    pub level: u32,
    pub offset: [f32; 2],
    pub order: [f32; 2],
    pub projection: u32,
    pub colormap: TextureHandle,
    pub clim: [f32; 2],
    pub opacity: f32,
    pub fill_value: f32,
    pub center_y: f32,
    pub custom: Vec<(String, f32)>,
}

/// One GPU draw call for one tile.
pub struct DrawPass {
    /// Identifies which compiled vertex shader the backend should bind —
    /// an opaque name the backend resolves, not source.
    pub vert: &'static str,
    /// Identifies which compiled fragment shader the backend should bind.
    pub frag: &'static str,
    /// Per-band samplers/attributes, in shader binding order.
    pub bands: Vec<BandResource>,
    pub uniforms: DrawUniforms,
    pub blend: bool,
    pub depth: bool,
    pub primitive: Primitive,
    /// Vertex (or instance) count for this call.
    pub count: u32,
}

/// The GPU command-submission boundary the engine drives every frame.
///
/// A host implements this against whatever command-submission library it
/// embeds; the engine only ever calls through this trait, never a concrete
/// device type. The `wgpu`-backed implementation behind the `wgpu-backend`
/// feature is the reference implementation for native/WebGL hosts.
pub trait GpuBackend {
    /// Allocate a buffer sized for `data` and upload it.
    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferHandle>;

    /// Overwrite an existing buffer's contents in place.
    fn update_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()>;

    /// Release a buffer previously returned by `create_buffer`.
    fn destroy_buffer(&mut self, handle: BufferHandle);

    /// Allocate a `width x height` single-channel float texture (one band).
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle>;

    /// Overwrite an existing texture's contents.
    fn update_texture(&mut self, handle: TextureHandle, width: u32, height: u32, data: &[f32]) -> Result<()>;

    /// Release a texture previously returned by `create_texture`.
    fn destroy_texture(&mut self, handle: TextureHandle);

    /// Allocate (or replace) the 1-D colormap lookup texture from a sampled
    /// [`Colormap`] table.
    fn create_colormap_texture(&mut self, samples: &[[f32; 4]]) -> Result<TextureHandle>;

    /// Submit one draw call.
    fn submit(&mut self, pass: &DrawPass) -> Result<()>;
}

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;
#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuBackend;
