//! Pyramid metadata parsing: zarr v2 (`.zattrs`/`.zarray`) and v3
//! (`zarr.json`) group/array metadata, reduced to what the engine needs to
//! resolve tiles — per-level shape and chunk shape, dimension names, and
//! the `multiscales` level list.

pub mod fill_value;

use crate::error::{MapEngineError, Result};
use crate::selector::{CoordinateAxis, ScalarValue};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

pub use fill_value::FillValue;

/// One pyramid level's array shape/chunking, keyed by its integer level
/// (0 = highest resolution, matching the `multiscales` convention).
#[derive(Debug, Clone)]
pub struct LevelMetadata {
    /// Array shape in the array's own dimension order.
    pub shape: Vec<usize>,
    /// Chunk shape in the same dimension order.
    pub chunk_shape: Vec<usize>,
}

/// Parsed pyramid metadata, version-agnostic after extraction.
#[derive(Debug, Clone)]
pub struct PyramidMetadata {
    /// Dimension names in array order (e.g. `["time", "y", "x"]`).
    pub dimensions: Vec<String>,
    /// Per-level shape/chunk-shape, keyed by zoom level.
    pub levels: HashMap<u32, LevelMetadata>,
    /// Highest zoom level present.
    pub max_zoom: u32,
    /// Tile size in pixels (chunk edge length for the spatial dims).
    pub tile_size: usize,
    /// Coordinate reference system; defaults to `EPSG:3857` with a warning
    /// when the source metadata omits it.
    pub crs: String,
    /// Fill value to treat as "no data", if declared.
    pub fill_value: Option<FillValue>,
    /// Non-spatial dimensions' coordinate arrays, keyed by dimension name,
    /// used to resolve a selector's scalar value to the chunk index that
    /// contains it. Dimensions with no coordinate array provided (or the
    /// spatial dims, which resolve from the tile key instead) are absent.
    pub coordinates: HashMap<String, CoordinateAxis>,
}

/// Parse one dimension's coordinate array (a JSON array of numbers or
/// strings) into a [`CoordinateAxis`], keyed by dimension name.
fn parse_coord_arrays(raw: &[(String, &[u8])]) -> Result<HashMap<String, CoordinateAxis>> {
    let mut out = HashMap::new();
    for (dim, bytes) in raw {
        let values: Vec<serde_json::Value> = serde_json::from_slice(bytes)?;
        let scalars = values
            .into_iter()
            .map(|v| match v.as_f64() {
                Some(n) => ScalarValue::Number(n),
                None => ScalarValue::Text(v.as_str().unwrap_or_default().to_string()),
            })
            .collect();
        out.insert(dim.clone(), CoordinateAxis { values: scalars });
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct ZarrV2Multiscale {
    datasets: Vec<ZarrV2Dataset>,
    #[serde(default)]
    crs: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZarrV2Dataset {
    path: String,
}

#[derive(Debug, Deserialize)]
struct ZarrV2ArrayMeta {
    shape: Vec<usize>,
    chunks: Vec<usize>,
    #[serde(default)]
    fill_value: Option<serde_json::Value>,
    dtype: String,
}

#[derive(Debug, Deserialize)]
struct ZarrV2Attrs {
    #[serde(default)]
    multiscales: Vec<ZarrV2Multiscale>,
    #[serde(rename = "_ARRAY_DIMENSIONS", default)]
    dimensions: Vec<String>,
}

/// Parse zarr v2 group metadata: a top-level `.zattrs` blob carrying
/// `multiscales`, one `.zarray` blob per referenced level path, and one
/// coordinate array per non-spatial dimension (dimension name paired with
/// its JSON array of values; pass `&[]` when none are available).
pub fn parse_v2(
    group_zattrs: &[u8],
    level_zarrays: &[(String, &[u8])],
    coord_arrays: &[(String, &[u8])],
) -> Result<PyramidMetadata> {
    let attrs: ZarrV2Attrs = serde_json::from_slice(group_zattrs)?;
    let multiscale = attrs
        .multiscales
        .first()
        .ok_or_else(|| MapEngineError::MetadataInvalid("missing multiscales".into()))?;
    if multiscale.datasets.is_empty() {
        return Err(MapEngineError::MetadataInvalid(
            "multiscales has no datasets".into(),
        ));
    }

    let mut levels = HashMap::new();
    let mut max_zoom = 0u32;
    let mut tile_size = None;
    let mut fill_value = None;

    for dataset in &multiscale.datasets {
        let level: u32 = dataset
            .path
            .trim_start_matches('/')
            .parse()
            .map_err(|_| {
                MapEngineError::MetadataInvalid(format!(
                    "dataset path '{}' is not a level index",
                    dataset.path
                ))
            })?;
        let (_, bytes) = level_zarrays
            .iter()
            .find(|(p, _)| p == &dataset.path)
            .ok_or_else(|| {
                MapEngineError::MetadataInvalid(format!(
                    "no .zarray provided for level {level}"
                ))
            })?;
        let array_meta: ZarrV2ArrayMeta = serde_json::from_slice(bytes)?;
        if tile_size.is_none() {
            tile_size = array_meta.chunks.last().copied();
            fill_value = array_meta
                .fill_value
                .as_ref()
                .and_then(fill_value::from_json)
                .or_else(|| fill_value::default_for_dtype(&array_meta.dtype));
        }
        max_zoom = max_zoom.max(level);
        levels.insert(
            level,
            LevelMetadata {
                shape: array_meta.shape,
                chunk_shape: array_meta.chunks,
            },
        );
    }

    let tile_size = tile_size
        .ok_or_else(|| MapEngineError::MetadataInvalid("missing pixels-per-tile".into()))?;

    let crs = multiscale.crs.clone().unwrap_or_else(|| {
        warn!("pyramid metadata omits crs, defaulting to EPSG:3857");
        "EPSG:3857".to_string()
    });

    let dimensions = if attrs.dimensions.is_empty() {
        vec!["y".to_string(), "x".to_string()]
    } else {
        attrs.dimensions
    };

    let coordinates = parse_coord_arrays(coord_arrays)?;

    Ok(PyramidMetadata {
        dimensions,
        levels,
        max_zoom,
        tile_size,
        crs,
        fill_value,
        coordinates,
    })
}

#[derive(Debug, Deserialize)]
struct ChunkGridV3 {
    configuration: ChunkGridConfig,
}

#[derive(Debug, Deserialize)]
struct ChunkGridConfig {
    chunk_shape: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct CodecV3 {
    name: String,
    #[serde(default)]
    configuration: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ArrayMetadataV3 {
    shape: Vec<usize>,
    chunk_grid: ChunkGridV3,
    #[serde(default)]
    codecs: Vec<CodecV3>,
    data_type: String,
    #[serde(default)]
    fill_value: Option<serde_json::Value>,
    #[serde(default)]
    attributes: serde_json::Value,
}

/// Parse zarr v3 metadata: a root `zarr.json` group (carrying
/// `attributes.multiscales`) plus one `zarr.json` per level array, plus one
/// coordinate array per non-spatial dimension (pass `&[]` when none are
/// available).
pub fn parse_v3(
    root_zarr_json: &[u8],
    level_zarr_jsons: &[(u32, &[u8])],
    coord_arrays: &[(String, &[u8])],
) -> Result<PyramidMetadata> {
    let root: serde_json::Value = serde_json::from_slice(root_zarr_json)?;
    let multiscales = root
        .pointer("/attributes/multiscales")
        .and_then(|v| v.as_array())
        .ok_or_else(|| MapEngineError::MetadataInvalid("missing multiscales".into()))?;
    let multiscale = multiscales
        .first()
        .ok_or_else(|| MapEngineError::MetadataInvalid("multiscales has no entries".into()))?;
    let crs = multiscale
        .get("crs")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if level_zarr_jsons.is_empty() {
        return Err(MapEngineError::MetadataInvalid(
            "multiscales has no datasets".into(),
        ));
    }

    let mut levels = HashMap::new();
    let mut max_zoom = 0u32;
    let mut tile_size = None;
    let mut fill_value = None;
    let mut dimensions = Vec::new();

    for (level, bytes) in level_zarr_jsons {
        let meta: ArrayMetadataV3 = serde_json::from_slice(bytes)?;
        if meta.data_type.is_empty() {
            return Err(MapEngineError::MetadataInvalid(
                "unsupported zarr version".into(),
            ));
        }
        let mut chunk_shape = meta.chunk_grid.configuration.chunk_shape.clone();
        if let Some(sharding) = meta.codecs.iter().find(|c| c.name == "sharding_indexed") {
            if let Some(shard_shape) = sharding
                .configuration
                .as_ref()
                .and_then(|c| c.get("chunk_shape"))
                .and_then(|v| v.as_array())
            {
                chunk_shape = shard_shape
                    .iter()
                    .filter_map(|v| v.as_u64().map(|n| n as usize))
                    .collect();
            }
        }
        if tile_size.is_none() {
            tile_size = chunk_shape.last().copied();
            fill_value = meta
                .fill_value
                .as_ref()
                .and_then(fill_value::from_json)
                .or_else(|| fill_value::default_for_dtype(&meta.data_type));
            if let Some(dims) = meta.attributes.get("_ARRAY_DIMENSIONS").and_then(|v| v.as_array())
            {
                dimensions = dims
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }
        max_zoom = max_zoom.max(*level);
        levels.insert(
            *level,
            LevelMetadata {
                shape: meta.shape,
                chunk_shape,
            },
        );
    }

    let tile_size = tile_size
        .ok_or_else(|| MapEngineError::MetadataInvalid("missing pixels-per-tile".into()))?;
    let crs = crs.unwrap_or_else(|| {
        warn!("pyramid metadata omits crs, defaulting to EPSG:3857");
        "EPSG:3857".to_string()
    });
    if dimensions.is_empty() {
        dimensions = vec!["y".to_string(), "x".to_string()];
    }

    let coordinates = parse_coord_arrays(coord_arrays)?;

    Ok(PyramidMetadata {
        dimensions,
        levels,
        max_zoom,
        tile_size,
        crs,
        fill_value,
        coordinates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v2_happy_path() {
        let zattrs = br#"{
            "multiscales": [{
                "datasets": [{"path": "0"}, {"path": "1"}],
                "crs": "EPSG:3857"
            }]
        }"#;
        let zarray0 = br#"{"shape":[256,256],"chunks":[256,256],"dtype":"<f4","fill_value":null}"#;
        let zarray1 = br#"{"shape":[128,128],"chunks":[128,128],"dtype":"<f4","fill_value":null}"#;
        let levels: Vec<(String, &[u8])> = vec![
            ("0".to_string(), zarray0.as_slice()),
            ("1".to_string(), zarray1.as_slice()),
        ];
        let meta = parse_v2(zattrs, &levels, &[]).unwrap();
        assert_eq!(meta.max_zoom, 1);
        assert_eq!(meta.tile_size, 256);
        assert_eq!(meta.crs, "EPSG:3857");
        assert!(meta.coordinates.is_empty());
    }

    #[test]
    fn test_parse_v2_coordinate_arrays_are_parsed() {
        let zattrs = br#"{
            "multiscales": [{
                "datasets": [{"path": "0"}],
                "crs": "EPSG:3857"
            }],
            "_ARRAY_DIMENSIONS": ["time", "y", "x"]
        }"#;
        let zarray0 = br#"{"shape":[4,256,256],"chunks":[2,256,256],"dtype":"<f4","fill_value":null}"#;
        let levels: Vec<(String, &[u8])> = vec![("0".to_string(), zarray0.as_slice())];
        let time_coords: &[u8] = br#"[0, 1, 2, 3]"#;
        let coords: Vec<(String, &[u8])> = vec![("time".to_string(), time_coords)];
        let meta = parse_v2(zattrs, &levels, &coords).unwrap();
        let axis = meta.coordinates.get("time").unwrap();
        assert_eq!(axis.values.len(), 4);
    }

    #[test]
    fn test_parse_v2_missing_multiscales_errors() {
        let zattrs = br#"{"other": true}"#;
        let err = parse_v2(zattrs, &[], &[]).unwrap_err();
        assert!(matches!(err, MapEngineError::MetadataInvalid(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_parse_v3_sharding_chunk_shape_override() {
        let root = br#"{"attributes": {"multiscales": [{"crs": "EPSG:3857"}]}}"#;
        let array0 = br#"{
            "shape": [4096, 4096],
            "chunk_grid": {"configuration": {"chunk_shape": [4096, 4096]}},
            "codecs": [{"name": "sharding_indexed", "configuration": {"chunk_shape": [256, 256]}}],
            "data_type": "float32",
            "attributes": {"_ARRAY_DIMENSIONS": ["y", "x"]}
        }"#;
        let levels: Vec<(u32, &[u8])> = vec![(0, array0.as_slice())];
        let meta = parse_v3(root, &levels, &[]).unwrap();
        assert_eq!(meta.tile_size, 256);
        assert_eq!(meta.dimensions, vec!["y".to_string(), "x".to_string()]);
    }
}
