use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::pipeline::errors::{CoercionError, PipelineError};

/// Loosely-typed parameters of a pipeline step, as they arrive from a form
pub type ParamMap = FxHashMap<String, Value>;

////////////////////
// String helpers //
////////////////////

/// Split a comma-separated string into its trimmed, non-empty tokens
///
/// ### Params
///
/// * `value` - The raw string, e.g. `" a, b ,c"`.
///
/// ### Returns
///
/// The tokens in order. Empty for a blank input.
pub fn parse_csv_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_string())
        .collect()
}

/// Parse a comma-separated list of integers
///
/// ### Params
///
/// * `value` - The raw string, e.g. `"1, 2,3"`.
///
/// ### Returns
///
/// `None` if there are no tokens, otherwise the integers in order. Fails on
/// the first token that is not an integer.
pub fn parse_int_list(value: &str) -> Result<Option<Vec<i64>>, CoercionError> {
    let items = parse_csv_list(value);
    if items.is_empty() {
        return Ok(None);
    }
    items
        .iter()
        .map(|x| {
            x.parse::<i64>()
                .map_err(|_| CoercionError::new(x, "an integer"))
        })
        .collect::<Result<Vec<i64>, CoercionError>>()
        .map(Some)
}

///////////////
// Coercions //
///////////////

/// Interpret a value as an integer
///
/// Integers pass as is, floats are truncated toward zero, strings are
/// trimmed and parsed, booleans map to 0/1.
pub fn coerce_int(value: &Value) -> Result<i64, CoercionError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Ok(f.trunc() as i64),
                    _ => Err(CoercionError::new(n, "an integer")),
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| CoercionError::new(s, "an integer")),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(CoercionError::new(other, "an integer")),
    }
}

/// Interpret a value as a flag
///
/// Strings such as `"false"`, `"0"`, `"no"`, `"off"` and the empty string
/// are false, any other string is true. Numbers are true when non-zero,
/// `null` is false, arrays and objects are true when non-empty.
///
/// This is not plain truthiness: under that rule every non-empty string,
/// `"false"` included, would be true.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !matches!(
            s.trim().to_lowercase().as_str(),
            "" | "false" | "0" | "no" | "off"
        ),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Interpret a value as an optional, trimmed string
///
/// `null` and blank strings are unset.
pub fn coerce_opt_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Interpret a value as an optional float
///
/// `null` and blank strings are unset. Non-finite values are rejected.
pub fn coerce_opt_float(value: &Value) -> Result<Option<f64>, CoercionError> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<f64>().ok()
        }
        _ => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(Some(f)),
        _ => Err(CoercionError::new(value, "a finite number")),
    }
}

/// Interpret a value as an optional list of integers
///
/// Strings go through `parse_int_list()`, a single number becomes a one
/// element list and arrays are converted element-wise. `null`, `false`,
/// blank strings and empty arrays are unset.
pub fn coerce_int_list(value: &Value) -> Result<Option<Vec<i64>>, CoercionError> {
    match value {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::String(s) => parse_int_list(s),
        Value::Number(_) => coerce_int(value).map(|i| Some(vec![i])),
        Value::Array(items) if items.is_empty() => Ok(None),
        Value::Array(items) => items
            .iter()
            .map(coerce_int)
            .collect::<Result<Vec<i64>, CoercionError>>()
            .map(Some),
        other => Err(CoercionError::new(other, "a list of integers")),
    }
}

/// Read a parameter with a coercion, falling back to a default when missing
///
/// ### Params
///
/// * `map` - The parameter map.
/// * `key` - The parameter name.
/// * `default` - Value used if the key is absent.
/// * `coerce` - The coercion to apply to a present value.
fn read_param<T>(
    map: &ParamMap,
    key: &str,
    default: T,
    coerce: impl Fn(&Value) -> Result<T, CoercionError>,
) -> Result<T, PipelineError> {
    match map.get(key) {
        None => Ok(default),
        Some(value) => coerce(value).map_err(|source| PipelineError::InvalidParam {
            param: key.to_string(),
            source,
        }),
    }
}

//////////////////////////
// Per-operation params //
//////////////////////////

/// Parameters of `pp.filter_cells`
#[derive(Clone, Debug, PartialEq)]
pub struct FilterCellsParams {
    pub min_genes: i64,
}

impl Default for FilterCellsParams {
    fn default() -> Self {
        Self { min_genes: 100 }
    }
}

impl FilterCellsParams {
    pub fn from_param_map(map: &ParamMap) -> Result<Self, PipelineError> {
        let default = Self::default();
        Ok(Self {
            min_genes: read_param(map, "min_genes", default.min_genes, coerce_int)?,
        })
    }
}

/// Parameters of `pp.filter_genes`
#[derive(Clone, Debug, PartialEq)]
pub struct FilterGenesParams {
    pub min_cells: i64,
}

impl Default for FilterGenesParams {
    fn default() -> Self {
        Self { min_cells: 3 }
    }
}

impl FilterGenesParams {
    pub fn from_param_map(map: &ParamMap) -> Result<Self, PipelineError> {
        let default = Self::default();
        Ok(Self {
            min_cells: read_param(map, "min_cells", default.min_cells, coerce_int)?,
        })
    }
}

/// Parameters of `pp.scrublet`
///
/// A missing `batch_key` defaults to `"sample"`; an explicit `null` or blank
/// value runs without batches.
#[derive(Clone, Debug, PartialEq)]
pub struct ScrubletStepParams {
    pub batch_key: Option<String>,
}

impl Default for ScrubletStepParams {
    fn default() -> Self {
        Self {
            batch_key: Some("sample".to_string()),
        }
    }
}

impl ScrubletStepParams {
    pub fn from_param_map(map: &ParamMap) -> Result<Self, PipelineError> {
        let default = Self::default();
        Ok(Self {
            batch_key: read_param(map, "batch_key", default.batch_key, |v| {
                Ok(coerce_opt_string(v))
            })?,
        })
    }
}

/// Parameters of `pp.calculate_qc_metrics`
///
/// ### Fields
///
/// * `use_mt` - Flag and report mitochondrial genes (`mt`).
/// * `use_ribo` - Flag and report ribosomal genes (`ribo`).
/// * `use_hb` - Flag and report hemoglobin genes (`hb`).
/// * `percent_top` - If `None`, the backend default applies.
/// * `log1p` - Add the `log1p_*` metric variants.
#[derive(Clone, Debug, PartialEq)]
pub struct QcMetricsParams {
    pub use_mt: bool,
    pub use_ribo: bool,
    pub use_hb: bool,
    pub percent_top: Option<Vec<i64>>,
    pub log1p: bool,
}

impl Default for QcMetricsParams {
    fn default() -> Self {
        Self {
            use_mt: true,
            use_ribo: true,
            use_hb: true,
            percent_top: None,
            log1p: true,
        }
    }
}

impl QcMetricsParams {
    pub fn from_param_map(map: &ParamMap) -> Result<Self, PipelineError> {
        let default = Self::default();
        let flag = |v: &Value| Ok(coerce_bool(v));
        Ok(Self {
            use_mt: read_param(map, "use_mt", default.use_mt, flag)?,
            use_ribo: read_param(map, "use_ribo", default.use_ribo, flag)?,
            use_hb: read_param(map, "use_hb", default.use_hb, flag)?,
            percent_top: read_param(map, "percent_top", default.percent_top, coerce_int_list)?,
            log1p: read_param(map, "log1p", default.log1p, flag)?,
        })
    }

    /// Names of the gene flag columns that are enabled, in fixed order
    pub fn qc_vars(&self) -> Vec<String> {
        [
            (self.use_mt, "mt"),
            (self.use_ribo, "ribo"),
            (self.use_hb, "hb"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| name.to_string())
        .collect()
    }
}

/// Parameters of `pp.normalize_total`
///
/// `target_sum` of `None` leaves the choice to the backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizeTotalParams {
    pub target_sum: Option<f64>,
}

impl NormalizeTotalParams {
    pub fn from_param_map(map: &ParamMap) -> Result<Self, PipelineError> {
        Ok(Self {
            target_sum: read_param(map, "target_sum", None, coerce_opt_float)?,
        })
    }
}

///////////
// Tests //
///////////
