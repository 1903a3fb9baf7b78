//! Opaque GPU texture handles, band-texture bookkeeping, and colormap
//! sampling.
//!
//! Texture mode uploads one band's sampled values as a single-channel
//! float texture per tile; the colormap itself is a small 1-D lookup
//! texture the shader indexes with the normalized, `clim`-scaled value.
//! [`Colormap`] owns building that lookup table from a host-supplied stop
//! list — the actual upload goes through [`super::GpuBackend::create_colormap_texture`].

use palette::LinSrgba;
use std::collections::HashMap;

/// Opaque reference to a GPU texture allocated through a [`super::GpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(u64);

impl TextureHandle {
    /// Construct a handle from a backend-assigned id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The backend-assigned id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Bookkeeping for one allocated texture.
#[derive(Debug, Clone, Copy)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
}

/// Handle-to-dimension bookkeeping a [`super::GpuBackend`] implementation
/// can reuse; it does not itself own GPU resources.
#[derive(Default)]
pub struct TextureRegistry {
    info: HashMap<TextureHandle, TextureInfo>,
    next_id: u64,
}

impl TextureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new allocation and return its handle.
    pub fn allocate(&mut self, width: u32, height: u32) -> TextureHandle {
        let handle = TextureHandle::new(self.next_id);
        self.next_id += 1;
        self.info.insert(handle, TextureInfo { width, height });
        handle
    }

    /// Look up an allocation's dimensions.
    pub fn info(&self, handle: TextureHandle) -> Option<&TextureInfo> {
        self.info.get(&handle)
    }

    /// Forget a texture (the backend is responsible for freeing the real resource).
    pub fn release(&mut self, handle: TextureHandle) {
        self.info.remove(&handle);
    }

    /// Number of live textures.
    pub fn len(&self) -> usize {
        self.info.len()
    }

    /// True if no textures are tracked.
    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

/// A named sequence of RGBA color stops, sampled uniformly into a
/// fixed-resolution 1-D lookup table for upload as the colormap texture.
#[derive(Debug, Clone)]
pub struct Colormap {
    stops: Vec<LinSrgba<f32>>,
}

impl Colormap {
    /// Build a colormap from ordered `[r, g, b, a]` stops in `0.0..=1.0`.
    pub fn from_rgba_stops(stops: Vec<[f32; 4]>) -> Self {
        Self {
            stops: stops
                .into_iter()
                .map(|c| LinSrgba::new(c[0], c[1], c[2], c[3]))
                .collect(),
        }
    }

    /// Sample `resolution` evenly spaced RGBA entries by linearly
    /// interpolating between adjacent stops — the lookup table
    /// `updateColormap` re-uploads whenever the host changes the palette.
    pub fn sample(&self, resolution: usize) -> Vec<[f32; 4]> {
        if self.stops.is_empty() {
            return vec![[0.0, 0.0, 0.0, 0.0]; resolution];
        }
        if self.stops.len() == 1 || resolution <= 1 {
            let c = self.stops[0];
            return vec![[c.red, c.green, c.blue, c.alpha]; resolution];
        }

        (0..resolution)
            .map(|i| {
                let t = i as f32 / (resolution - 1) as f32;
                let scaled = t * (self.stops.len() - 1) as f32;
                let idx = scaled.floor() as usize;
                let frac = scaled - idx as f32;
                let a = self.stops[idx.min(self.stops.len() - 1)];
                let b = self.stops[(idx + 1).min(self.stops.len() - 1)];
                [
                    a.red + (b.red - a.red) * frac,
                    a.green + (b.green - a.green) * frac,
                    a.blue + (b.blue - a.blue) * frac,
                    a.alpha + (b.alpha - a.alpha) * frac,
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_allocate_and_release() {
        let mut reg = TextureRegistry::new();
        let h = reg.allocate(256, 256);
        assert_eq!(reg.info(h).unwrap().width, 256);
        reg.release(h);
        assert!(reg.info(h).is_none());
    }

    #[test]
    fn test_colormap_single_stop_is_constant() {
        let cmap = Colormap::from_rgba_stops(vec![[1.0, 0.0, 0.0, 1.0]]);
        let sampled = cmap.sample(8);
        assert_eq!(sampled.len(), 8);
        assert!(sampled.iter().all(|c| *c == [1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_colormap_interpolates_between_stops() {
        let cmap = Colormap::from_rgba_stops(vec![[0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]]);
        let sampled = cmap.sample(3);
        assert_eq!(sampled[0], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(sampled[2], [1.0, 1.0, 1.0, 1.0]);
        assert!((sampled[1][0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_colormap_empty_is_transparent_black() {
        let cmap = Colormap::from_rgba_stops(vec![]);
        assert_eq!(cmap.sample(4), vec![[0.0, 0.0, 0.0, 0.0]; 4]);
    }
}
