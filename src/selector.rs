//! Band/selector algebra: turning a per-dimension selector into the set of
//! bands to render and the chunks each band needs.

use std::collections::HashMap;

/// A scalar selector value: either a coordinate number or a category label.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// Numeric coordinate value (e.g. a pressure level, a timestamp).
    Number(f64),
    /// Categorical coordinate value (e.g. an ensemble member name).
    Text(String),
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Number(n) => {
                if n.fract() == 0.0 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            ScalarValue::Text(t) => write!(f, "{t}"),
        }
    }
}

/// Equality for coordinate lookup: numeric coordinates compare with an
/// epsilon tolerance since they round-trip through `f64` parsing, text
/// coordinates compare exactly.
fn scalar_eq(a: &ScalarValue, b: &ScalarValue) -> bool {
    match (a, b) {
        (ScalarValue::Number(x), ScalarValue::Number(y)) => (x - y).abs() < 1e-9,
        (ScalarValue::Text(x), ScalarValue::Text(y)) => x == y,
        _ => false,
    }
}

/// One dimension's 1-D coordinate array, in on-disk order. Used to resolve a
/// selector's scalar value into the chunk index that contains it, and to
/// enumerate every chunk covering the axis when a dimension is left
/// unconstrained.
#[derive(Debug, Clone, Default)]
pub struct CoordinateAxis {
    /// Coordinate values in array-index order.
    pub values: Vec<ScalarValue>,
}

impl CoordinateAxis {
    /// The chunk index containing `value`, or `None` if `value` isn't one of
    /// this axis's coordinates.
    pub fn chunk_index_for(&self, value: &ScalarValue, chunk_len: usize) -> Option<usize> {
        let chunk_len = chunk_len.max(1);
        self.values
            .iter()
            .position(|v| scalar_eq(v, value))
            .map(|idx| idx / chunk_len)
    }

    /// Every chunk index covering this axis, in order.
    pub fn all_chunks(&self, chunk_len: usize) -> Vec<usize> {
        let chunk_len = chunk_len.max(1);
        if self.values.is_empty() {
            return vec![0];
        }
        let n = (self.values.len() + chunk_len - 1) / chunk_len;
        (0..n.max(1)).collect()
    }
}

/// One dimension's selector value: a single value, or a list of values to
/// be expanded into separate bands (the Cartesian-product axis).
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorValue {
    /// A single fixed value for this dimension.
    Scalar(ScalarValue),
    /// A list of values; each combination contributes one band.
    List(Vec<ScalarValue>),
}

/// Maps a non-spatial dimension name to its selector value.
pub type Selector = HashMap<String, SelectorValue>;

/// Expand a selector into the set of bands it implies. Each band is named
/// by joining its per-dimension values with `_`, in the selector's
/// insertion-independent, deterministically sorted dimension order; scalar
/// dimensions contribute their fixed value to every band.
///
/// Returns a map from band name to that band's fully resolved per-dimension
/// values (scalar dims included), so downstream chunk resolution does not
/// need to re-consult the original selector.
pub fn band_information(selector: &Selector) -> HashMap<String, HashMap<String, ScalarValue>> {
    let mut dims: Vec<&String> = selector.keys().collect();
    dims.sort();

    let list_dims: Vec<&String> = dims
        .iter()
        .filter(|d| matches!(selector[**d], SelectorValue::List(_)))
        .copied()
        .collect();

    if list_dims.is_empty() {
        let mut band = HashMap::new();
        for d in &dims {
            if let SelectorValue::Scalar(v) = &selector[*d] {
                band.insert((*d).clone(), v.clone());
            }
        }
        let mut out = HashMap::new();
        out.insert("default".to_string(), band);
        return out;
    }

    let mut combos: Vec<Vec<(String, ScalarValue)>> = vec![Vec::new()];
    for dim in &list_dims {
        let values = match &selector[*dim] {
            SelectorValue::List(vs) => vs,
            _ => unreachable!(),
        };
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for v in values {
                let mut extended = combo.clone();
                extended.push(((*dim).clone(), v.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }

    let mut out = HashMap::new();
    for combo in combos {
        let mut band: HashMap<String, ScalarValue> = combo.iter().cloned().collect();
        for d in &dims {
            if let SelectorValue::Scalar(v) = &selector[*d] {
                band.insert((*d).clone(), v.clone());
            }
        }
        let name = combo
            .iter()
            .map(|(_, v)| v.to_string())
            .collect::<Vec<_>>()
            .join("_");
        out.insert(name, band);
    }
    out
}

/// Resolve the chunk-index combinations a single band needs for one tile.
///
/// `dims` is the array's full dimension name list in order; `coordinates`
/// maps non-spatial dimension names to their 1-D coordinate array, used to
/// turn a band's resolved scalar value into the chunk index that actually
/// contains it; `chunk_shape` is the chunk edge length per dim (same order
/// as `dims`); `tile_x`/`tile_y` are the spatial chunk indices for this tile
/// at its pyramid level.
///
/// A dimension fixed in `band` resolves to the single chunk containing that
/// coordinate (scalar selectors, and each band's fixed value for list
/// selectors, per spec.md §4.4). A dimension present in `dims` but absent
/// from `band` is unconstrained: with a known coordinate array it fans out
/// into every chunk covering the axis; without one (no coordinate array
/// available) it falls back to chunk 0. Because an unconstrained dimension
/// can contribute more than one option, the result is the full Cartesian
/// product across `dims`, not a single chunk tuple.
pub fn chunks_for(
    band: &HashMap<String, ScalarValue>,
    dims: &[String],
    coordinates: &HashMap<String, CoordinateAxis>,
    chunk_shape: &[usize],
    spatial_dims: (&str, &str),
    tile_x: usize,
    tile_y: usize,
) -> Vec<Vec<usize>> {
    let mut per_dim: Vec<Vec<usize>> = Vec::with_capacity(dims.len());
    for (i, dim) in dims.iter().enumerate() {
        let chunk_len = chunk_shape.get(i).copied().unwrap_or(1);
        let options = if dim == spatial_dims.0 {
            vec![tile_y]
        } else if dim == spatial_dims.1 {
            vec![tile_x]
        } else if let Some(value) = band.get(dim) {
            match coordinates
                .get(dim)
                .and_then(|axis| axis.chunk_index_for(value, chunk_len))
            {
                Some(idx) => vec![idx],
                None => vec![0],
            }
        } else if let Some(axis) = coordinates.get(dim) {
            axis.all_chunks(chunk_len)
        } else {
            vec![0]
        };
        per_dim.push(options);
    }
    cartesian_product(&per_dim)
}

fn cartesian_product(options: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
    for dim_options in options {
        let mut next = Vec::with_capacity(combos.len() * dim_options.len().max(1));
        for combo in &combos {
            for &v in dim_options {
                let mut extended = combo.clone();
                extended.push(v);
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

/// One band's resolved chunks and the coordinate-label `keys` spec.md's
/// `get_point_values` tags each sampled point with.
#[derive(Debug, Clone)]
pub struct ResolvedBand {
    /// Every chunk-index tuple this band needs (more than one only when an
    /// unconstrained dimension fans out across several chunks).
    pub chunks: Vec<Vec<usize>>,
    /// Varying (list-valued or unconstrained) non-spatial dimension labels
    /// for this band, each as `"{dim}_{value}"`; empty for a fully scalar
    /// selector, matching spec.md's "keys = []" case.
    pub keys: Vec<String>,
}

/// Expand `selector` into its bands and resolve each one's required chunks
/// (and point-value key labels) for the tile at `(tile_x, tile_y)`, in one
/// pass.
pub fn resolve_bands(
    selector: &Selector,
    dims: &[String],
    coordinates: &HashMap<String, CoordinateAxis>,
    chunk_shape: &[usize],
    spatial_dims: (&str, &str),
    tile_x: usize,
    tile_y: usize,
) -> HashMap<String, ResolvedBand> {
    band_information(selector)
        .into_iter()
        .map(|(name, band)| {
            let chunks = chunks_for(&band, dims, coordinates, chunk_shape, spatial_dims, tile_x, tile_y);
            let keys = band_keys(&band, selector, dims, spatial_dims);
            (name, ResolvedBand { chunks, keys })
        })
        .collect()
}

fn band_keys(
    band: &HashMap<String, ScalarValue>,
    selector: &Selector,
    dims: &[String],
    spatial_dims: (&str, &str),
) -> Vec<String> {
    dims.iter()
        .filter(|d| d.as_str() != spatial_dims.0 && d.as_str() != spatial_dims.1)
        .filter_map(|d| match selector.get(d) {
            Some(SelectorValue::List(_)) => band.get(d).map(|v| format!("{d}_{v}")),
            Some(SelectorValue::Scalar(_)) => None,
            None => Some(d.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_information_no_lists() {
        let mut selector = Selector::new();
        selector.insert("time".into(), SelectorValue::Scalar(ScalarValue::Number(3.0)));
        let bands = band_information(&selector);
        assert_eq!(bands.len(), 1);
        assert!(bands.contains_key("default"));
    }

    #[test]
    fn test_band_information_cartesian_product() {
        let mut selector = Selector::new();
        selector.insert(
            "time".into(),
            SelectorValue::List(vec![ScalarValue::Number(0.0), ScalarValue::Number(1.0)]),
        );
        selector.insert(
            "level".into(),
            SelectorValue::List(vec![ScalarValue::Number(10.0), ScalarValue::Number(20.0)]),
        );
        let bands = band_information(&selector);
        assert_eq!(bands.len(), 4);
    }

    #[test]
    fn test_band_information_mixed_scalar_and_list() {
        let mut selector = Selector::new();
        selector.insert(
            "time".into(),
            SelectorValue::List(vec![ScalarValue::Number(0.0), ScalarValue::Number(1.0)]),
        );
        selector.insert(
            "member".into(),
            SelectorValue::Scalar(ScalarValue::Text("control".into())),
        );
        let bands = band_information(&selector);
        assert_eq!(bands.len(), 2);
        for band in bands.values() {
            assert_eq!(band.get("member"), Some(&ScalarValue::Text("control".into())));
        }
    }

    #[test]
    fn test_chunks_for_uses_tile_indices_for_spatial_dims() {
        let dims = vec!["y".to_string(), "x".to_string(), "time".to_string()];
        let mut coordinates = HashMap::new();
        coordinates.insert(
            "time".to_string(),
            CoordinateAxis {
                values: (0..6).map(|i| ScalarValue::Number(i as f64)).collect(),
            },
        );
        let mut band = HashMap::new();
        band.insert("time".to_string(), ScalarValue::Number(2.0));
        let chunks = chunks_for(&band, &dims, &coordinates, &[1, 1, 2], ("y", "x"), 5, 7);
        assert_eq!(chunks, vec![vec![7, 5, 1]]);
    }

    #[test]
    fn test_chunks_for_unconstrained_dimension_fans_out_every_covering_chunk() {
        let dims = vec!["y".to_string(), "x".to_string(), "time".to_string()];
        let mut coordinates = HashMap::new();
        coordinates.insert(
            "time".to_string(),
            CoordinateAxis {
                values: (0..6).map(|i| ScalarValue::Number(i as f64)).collect(),
            },
        );
        let band = HashMap::new();
        let chunks = chunks_for(&band, &dims, &coordinates, &[1, 1, 2], ("y", "x"), 0, 0);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c[0] == 0 && c[1] == 0));
    }

    #[test]
    fn test_chunks_for_unknown_dimension_defaults_to_chunk_zero() {
        let dims = vec!["y".to_string(), "x".to_string(), "ensemble".to_string()];
        let band = HashMap::new();
        let coordinates = HashMap::new();
        let chunks = chunks_for(&band, &dims, &coordinates, &[1, 1, 1], ("y", "x"), 0, 0);
        assert_eq!(chunks, vec![vec![0, 0, 0]]);
    }

    #[test]
    fn test_resolve_bands_empty_selector_has_no_keys() {
        let selector = Selector::new();
        let dims = vec!["y".to_string(), "x".to_string()];
        let resolved = resolve_bands(&selector, &dims, &HashMap::new(), &[1, 1], ("y", "x"), 0, 0);
        let band = resolved.get("default").unwrap();
        assert!(band.keys.is_empty());
        assert_eq!(band.chunks, vec![vec![0, 0]]);
    }

    #[test]
    fn test_resolve_bands_list_dimension_produces_keys() {
        let mut selector = Selector::new();
        selector.insert(
            "time".into(),
            SelectorValue::List(vec![ScalarValue::Number(2020.0), ScalarValue::Number(2021.0)]),
        );
        let dims = vec!["y".to_string(), "x".to_string(), "time".to_string()];
        let resolved = resolve_bands(&selector, &dims, &HashMap::new(), &[1, 1, 1], ("y", "x"), 0, 0);
        assert_eq!(resolved.len(), 2);
        for band in resolved.values() {
            assert_eq!(band.keys, vec!["time_2020".to_string()]);
        }
    }
}
