//! Error types for the pyramid tile engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, MapEngineError>;

/// Errors that can occur while loading, resolving, or rendering a pyramid.
#[derive(Error, Debug)]
pub enum MapEngineError {
    /// Pyramid metadata (zarr v2 `.zattrs`/`.zarray` or v3 `zarr.json`) is
    /// missing a required field or carries an unsupported version.
    #[error("invalid pyramid metadata: {0}")]
    MetadataInvalid(String),

    /// Requested or configured coordinate projection is unknown or
    /// inconsistent with the pyramid's declared CRS.
    #[error("invalid projection: {0}")]
    ProjectionInvalid(String),

    /// Selector references a dimension, value, or band combination that
    /// does not exist on the array, or a resolved slice has the wrong rank.
    #[error("invalid selector: {0}")]
    SelectorInvalid(String),

    /// Region query radius/unit combination cannot be converted to meters.
    #[error("invalid units: {0}")]
    UnitsInvalid(String),

    /// Host-provided `ChunkLoader` failed to fetch chunk bytes.
    #[error("transport fault loading chunk {chunk:?} at level {level}: {source}")]
    TransportFault {
        level: u32,
        chunk: Vec<usize>,
        source: String,
    },

    /// Requested draw mode is not one of `texture`, `grid`, `dotgrid`.
    #[error("invalid draw mode: {0}")]
    ModeInvalid(String),

    /// Texture creation or upload error from the GPU backend.
    #[error("texture error: {0}")]
    Texture(String),

    /// Buffer creation or management error from the GPU backend.
    #[error("buffer error: {0}")]
    Buffer(String),

    /// Chunk cache internal error (eviction bookkeeping, capacity).
    #[error("chunk cache error: {0}")]
    ChunkCache(String),

    /// I/O error surfaced while parsing host-supplied bytes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error (metadata, style).
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid engine configuration at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not supported by the current engine configuration.
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl MapEngineError {
    /// Check if the error is recoverable without reconstructing the engine.
    ///
    /// Transport faults and chunk cache pressure are transient; everything
    /// else reflects a structural mismatch between configuration and data.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MapEngineError::TransportFault { .. } | MapEngineError::ChunkCache(_)
        )
    }

    /// Check if the error is fatal and requires the engine to be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MapEngineError::MetadataInvalid(_)
                | MapEngineError::ProjectionInvalid(_)
                | MapEngineError::UnitsInvalid(_)
                | MapEngineError::ModeInvalid(_)
                | MapEngineError::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverability() {
        let recoverable = MapEngineError::TransportFault {
            level: 2,
            chunk: vec![0, 1],
            source: "timeout".to_string(),
        };
        assert!(recoverable.is_recoverable());
        assert!(!recoverable.is_fatal());

        let fatal = MapEngineError::MetadataInvalid("missing multiscales".to_string());
        assert!(!fatal.is_recoverable());
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_selector_invalid_not_recoverable() {
        let err = MapEngineError::SelectorInvalid("unknown dimension 'depth'".to_string());
        assert!(!err.is_recoverable());
        assert!(!err.is_fatal());
    }
}
