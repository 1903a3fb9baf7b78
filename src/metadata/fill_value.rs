//! Default "no data" fill values by zarr dtype string.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// A fill/no-data value, stored wide enough to represent any supported dtype.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillValue {
    /// Integer-valued fill (covers all int/uint dtypes).
    Int(i64),
    /// Floating-point fill.
    Float(f64),
}

impl FillValue {
    /// Compare a sampled f64 value against this fill value within tolerance.
    pub fn matches(&self, value: f64) -> bool {
        match self {
            FillValue::Int(i) => value == *i as f64,
            FillValue::Float(f) => {
                if f.is_nan() {
                    value.is_nan()
                } else {
                    (value - f).abs() < f64::EPSILON
                }
            }
        }
    }
}

// Matches the pyramid's documented per-dtype "no data" conventions, not the
// natural MIN/MAX of the storage type (e.g. `<i2` reserves `-32768` and fills
// with `-32767`, one in from the true minimum).
static DEFAULTS: Lazy<HashMap<&'static str, FillValue>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("|S1", FillValue::Int(0));
    m.insert("<i1", FillValue::Int(-127));
    m.insert("|i1", FillValue::Int(-127));
    m.insert("|u1", FillValue::Int(255));
    m.insert("<i2", FillValue::Int(-32767));
    m.insert("<u2", FillValue::Int(65535));
    m.insert("<i4", FillValue::Int(-2147483647));
    m.insert("<u4", FillValue::Int(4294967295));
    m.insert("<u8", FillValue::Float(1.8446744073709552e19));
    m.insert("<f4", FillValue::Float(9.969209968386869e36));
    m.insert("<f8", FillValue::Float(9.969209968386869e36));
    // zarr v3 `data_type` spellings
    m.insert("int8", FillValue::Int(-127));
    m.insert("uint8", FillValue::Int(255));
    m.insert("int16", FillValue::Int(-32767));
    m.insert("uint16", FillValue::Int(65535));
    m.insert("int32", FillValue::Int(-2147483647));
    m.insert("uint32", FillValue::Int(4294967295));
    m.insert("uint64", FillValue::Float(1.8446744073709552e19));
    m.insert("float32", FillValue::Float(9.969209968386869e36));
    m.insert("float64", FillValue::Float(9.969209968386869e36));
    m
});

/// Look up the default fill value for a dtype string, if known.
pub fn default_for_dtype(dtype: &str) -> Option<FillValue> {
    DEFAULTS.get(dtype).copied()
}

/// Parse an explicit `fill_value` JSON field (zarr v2 or v3).
pub fn from_json(value: &serde_json::Value) -> Option<FillValue> {
    if value.is_null() {
        return None;
    }
    if let Some(s) = value.as_str() {
        if s == "NaN" {
            return Some(FillValue::Float(f64::NAN));
        }
        return None;
    }
    if let Some(i) = value.as_i64() {
        return Some(FillValue::Int(i));
    }
    value.as_f64().map(FillValue::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_for_known_dtype() {
        assert_eq!(default_for_dtype("<u1"), None);
        assert_eq!(default_for_dtype("|u1"), Some(FillValue::Int(255)));
        assert_eq!(default_for_dtype("<i2"), Some(FillValue::Int(-32767)));
        assert_eq!(
            default_for_dtype("float32"),
            Some(FillValue::Float(9.969209968386869e36))
        );
    }

    #[test]
    fn test_from_json_nan_string() {
        let v = serde_json::json!("NaN");
        assert_eq!(from_json(&v), Some(FillValue::Float(f64::NAN)));
    }

    #[test]
    fn test_from_json_numeric() {
        let v = serde_json::json!(-128);
        assert_eq!(from_json(&v), Some(FillValue::Int(-128)));
    }

    #[test]
    fn test_fill_value_matches() {
        let f = FillValue::Float(f64::NAN);
        assert!(f.matches(f64::NAN));
        assert!(!f.matches(1.0));

        let i = FillValue::Int(255);
        assert!(i.matches(255.0));
    }
}
