//! Camera boundary between the host's map/windowing library and the engine.
//!
//! The engine never owns a camera: the host map library (out of scope here)
//! is the authority on center, zoom, and viewport size. [`CameraSource`] is
//! the narrow read-only interface the engine polls each frame; [`CameraState`]
//! is the plain snapshot the engine stores internally after polling.

pub mod projection;

/// Snapshot of camera state the engine needs to resolve tiles and build
/// uniforms. Captured once per `update_camera` call so the rest of a frame
/// sees a consistent view even if the host's camera keeps moving.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    /// Map center in (lon, lat) degrees.
    pub center: (f64, f64),
    /// Fractional zoom level.
    pub zoom: f32,
    /// Viewport size in physical pixels (width, height).
    pub viewport: (u32, u32),
    /// Device pixel ratio.
    pub pixel_ratio: f32,
}

impl CameraState {
    /// Build a camera state directly from explicit `center`/`zoom` props.
    pub fn from_explicit(center: (f64, f64), zoom: f32, viewport: (u32, u32)) -> Self {
        Self {
            center,
            zoom,
            viewport,
            pixel_ratio: 1.0,
        }
    }

    /// Build a camera state by polling a host-provided [`CameraSource`].
    pub fn from_source(source: &dyn CameraSource) -> Self {
        Self {
            center: source.center(),
            zoom: source.zoom(),
            viewport: source.viewport_size(),
            pixel_ratio: source.pixel_ratio(),
        }
    }
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            center: (0.0, 0.0),
            zoom: 0.0,
            viewport: (1, 1),
            pixel_ratio: 1.0,
        }
    }
}

/// Interface a host map/windowing library implements so the engine can read
/// its camera without depending on that library directly. Stands in for the
/// `viewState` object described by the engine's external interface: when a
/// [`CameraSource`] is supplied it is the sole source of truth over any
/// `center`/`zoom` constructor props (see `engine::CameraInput`).
pub trait CameraSource: Send + Sync {
    /// Map center in (lon, lat) degrees.
    fn center(&self) -> (f64, f64);
    /// Fractional zoom level.
    fn zoom(&self) -> f32;
    /// Viewport size in physical pixels (width, height).
    fn viewport_size(&self) -> (u32, u32);
    /// Device pixel ratio; implementations with no DPI concept should return 1.0.
    fn pixel_ratio(&self) -> f32 {
        1.0
    }
}

/// Uniform data mirroring the camera-dependent fields of the shader contract
/// (`camera`, `viewportWidth`, `viewportHeight`, `pixelRatio`, `zoom`).
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniform {
    /// Map center in (lon, lat), as f32 for GPU upload.
    pub camera: [f32; 2],
    /// Viewport width in physical pixels.
    pub viewport_width: f32,
    /// Viewport height in physical pixels.
    pub viewport_height: f32,
    /// Device pixel ratio.
    pub pixel_ratio: f32,
    /// Fractional zoom level.
    pub zoom: f32,
    /// Padding for 16-byte alignment.
    pub _padding: [f32; 2],
}

impl CameraUniform {
    /// Build a uniform from a camera snapshot.
    pub fn from_state(state: &CameraState) -> Self {
        Self {
            camera: [state.center.0 as f32, state.center.1 as f32],
            viewport_width: state.viewport.0 as f32,
            viewport_height: state.viewport.1 as f32,
            pixel_ratio: state.pixel_ratio,
            zoom: state.zoom,
            _padding: [0.0; 2],
        }
    }
}
