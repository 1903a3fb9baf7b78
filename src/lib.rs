//! # Pyramid Engine
//!
//! Client-side raster map tile engine for streaming multidimensional
//! scientific array pyramids (Zarr v2/v3) onto a slippy map.
//!
//! This crate provides:
//! - Zarr v2/v3 pyramid metadata parsing, including `sharding_indexed` chunk
//!   shape overrides
//! - A chunk loader registry with an in-flight-dedup, byte-bounded LRU cache
//! - Selector/band algebra over list-valued dimensions
//! - Level-of-detail fallback across ancestor and descendant tiles
//! - Web Mercator and Equirectangular projection support
//! - Geodesic circle region queries
//! - A `GpuBackend`-generic engine orchestrating tiles, the camera, and draw
//!   submission, with a `wgpu`-backed implementation behind the
//!   `wgpu-backend` feature
//!
//! ## Features
//!
//! - `wgpu-backend` - Enable the `wgpu`-backed [`renderer::GpuBackend`] implementation
//!
//! ## Example
//!
//! ```rust,no_run
//! use pyramid_engine::prelude::*;
//!
//! async fn setup_engine(loaders: LoaderRegistry, metadata: PyramidMetadata, gpu: impl GpuBackend) {
//!     let config = EngineConfig {
//!         mode: DrawMode::Texture,
//!         version: PyramidVersion::V3,
//!         variable: "temperature".to_string(),
//!         selector: Default::default(),
//!         clim: [0.0, 1.0],
//!         opacity: 1.0,
//!         display: true,
//!         colormap: Colormap::from_rgba_stops(vec![[0.0, 0.0, 1.0, 1.0], [1.0, 0.0, 0.0, 1.0]]),
//!         fill_value: None,
//!         order: None,
//!         projection: None,
//!         on_invalidate: None,
//!         on_invalidate_region: None,
//!         on_loading_change: None,
//!         on_set_metadata: None,
//!     };
//!
//!     let _engine = Engine::construct(config, metadata, loaders, gpu);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Core modules
pub mod camera;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod loading;
pub mod lod;
pub mod metadata;
pub mod region;
pub mod renderer;
pub mod selector;
pub mod tile;
pub mod viewport;

// Re-export commonly used types
pub use camera::{CameraState, CameraUniform};
pub use camera::projection::{Projection, ProjectionType};
pub use chunk::{ChunkLoader, LoaderRegistry};
pub use engine::{CameraInput, DrawMode, Engine, EngineConfig, PyramidVersion, TileLifecycle};
pub use error::{MapEngineError, Result};
pub use loading::{LoadingTracker, SharedLoadingTracker};
pub use metadata::{LevelMetadata, PyramidMetadata};
pub use region::{DistanceUnit, Region, RegionPoint, RegionResult};
pub use renderer::{BandResource, Colormap, DrawPass, DrawUniforms, GpuBackend, Primitive};
pub use selector::{Selector, SelectorValue};
pub use tile::{Tile, TileKey};
pub use viewport::{DrawOrder, RenderOffset, Resolver};

/// Current version of the pyramid engine crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for embedding the engine in a host application.
pub mod prelude {
    //! Prelude module for convenient imports.
    //!
    //! This module re-exports the most commonly used types and traits.

    pub use crate::camera::projection::ProjectionType;
    pub use crate::chunk::LoaderRegistry;
    pub use crate::engine::{CameraInput, DrawMode, Engine, EngineConfig, PyramidVersion};
    pub use crate::error::{MapEngineError, Result};
    pub use crate::metadata::PyramidMetadata;
    pub use crate::region::Region;
    pub use crate::renderer::{Colormap, GpuBackend};
    pub use crate::selector::Selector;
    pub use crate::tile::TileKey;
}
