use serde::Serialize;
use serde_json::json;

use crate::pipeline::params::ParamMap;

///////////
// Types //
///////////

/// Namespace group of a module, mirroring `pp`, `tl` and `pl`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleGroup {
    /// Preprocessing
    Pp,
    /// Tools
    Tl,
    /// Plotting
    Pl,
}

/// Immutable descriptor of an available module
///
/// ### Fields
///
/// * `id` - Unique identifier, e.g. `"pp.filter_cells"`.
/// * `group` - The `ModuleGroup`.
/// * `title` - Human readable title.
/// * `scanpy_qualname` - Qualified name of the wrapped library function.
/// * `color_hex` - Display colour for the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ModuleSpec {
    pub id: &'static str,
    pub group: ModuleGroup,
    pub title: &'static str,
    pub scanpy_qualname: &'static str,
    pub color_hex: &'static str,
}

const PP_COLOR: &str = "#2D6CDF";

static MODULES: [ModuleSpec; 6] = [
    ModuleSpec {
        id: "pp.filter_cells",
        group: ModuleGroup::Pp,
        title: "Filter Cells",
        scanpy_qualname: "scanpy.pp.filter_cells",
        color_hex: PP_COLOR,
    },
    ModuleSpec {
        id: "pp.filter_genes",
        group: ModuleGroup::Pp,
        title: "Filter Genes",
        scanpy_qualname: "scanpy.pp.filter_genes",
        color_hex: PP_COLOR,
    },
    ModuleSpec {
        id: "pp.scrublet",
        group: ModuleGroup::Pp,
        title: "Scrublet (Doublet Detection)",
        scanpy_qualname: "scanpy.pp.scrublet",
        color_hex: PP_COLOR,
    },
    ModuleSpec {
        id: "pp.calculate_qc_metrics",
        group: ModuleGroup::Pp,
        title: "Calculate QC Metrics",
        scanpy_qualname: "scanpy.pp.calculate_qc_metrics",
        color_hex: PP_COLOR,
    },
    ModuleSpec {
        id: "pp.normalize_total",
        group: ModuleGroup::Pp,
        title: "Normalize Total Counts",
        scanpy_qualname: "scanpy.pp.normalize_total",
        color_hex: PP_COLOR,
    },
    ModuleSpec {
        id: "pp.log1p",
        group: ModuleGroup::Pp,
        title: "Log1p",
        scanpy_qualname: "scanpy.pp.log1p",
        color_hex: PP_COLOR,
    },
];

///////////////
// Functions //
///////////////

/// All supported modules in declaration order
pub fn available_modules() -> &'static [ModuleSpec] {
    &MODULES
}

/// Look up a module descriptor by its identifier
pub fn find_module(id: &str) -> Option<&'static ModuleSpec> {
    MODULES.iter().find(|spec| spec.id == id)
}

impl ModuleSpec {
    /// Parameters a freshly added pipeline node starts with
    ///
    /// These are the values a form shows before the user edits anything;
    /// they match the defaults applied when a parameter is missing.
    pub fn default_params(&self) -> ParamMap {
        let mut params = ParamMap::default();
        let pairs: Vec<(&str, serde_json::Value)> = match self.id {
            "pp.filter_cells" => vec![("min_genes", json!(100))],
            "pp.filter_genes" => vec![("min_cells", json!(3))],
            "pp.scrublet" => vec![("batch_key", json!("sample"))],
            "pp.calculate_qc_metrics" => vec![
                ("use_mt", json!(true)),
                ("use_ribo", json!(true)),
                ("use_hb", json!(true)),
                ("percent_top", json!("")),
                ("log1p", json!(true)),
            ],
            "pp.normalize_total" => vec![("target_sum", json!(""))],
            _ => Vec::new(),
        };
        for (key, value) in pairs {
            params.insert(key.to_string(), value);
        }
        params
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_declaration_order() {
        let ids: Vec<&str> = available_modules().iter().map(|m| m.id).collect();

        assert_eq!(
            ids,
            vec![
                "pp.filter_cells",
                "pp.filter_genes",
                "pp.scrublet",
                "pp.calculate_qc_metrics",
                "pp.normalize_total",
                "pp.log1p",
            ]
        );
    }

    #[test]
    fn test_ids_unique_and_idempotent() {
        let ids: FxHashSet<&str> = available_modules().iter().map(|m| m.id).collect();

        assert_eq!(ids.len(), available_modules().len());
        assert_eq!(available_modules(), available_modules());
    }

    #[test]
    fn test_find_module() {
        let spec = find_module("pp.scrublet").unwrap();

        assert_eq!(spec.title, "Scrublet (Doublet Detection)");
        assert_eq!(spec.scanpy_qualname, "scanpy.pp.scrublet");
        assert!(find_module("pp.nonexistent").is_none());
    }

    #[test]
    fn test_serialise_for_listing() {
        let value = serde_json::to_value(available_modules()[0]).unwrap();

        assert_eq!(
            value,
            json!({
                "id": "pp.filter_cells",
                "group": "pp",
                "title": "Filter Cells",
                "scanpy_qualname": "scanpy.pp.filter_cells",
                "color_hex": "#2D6CDF",
            })
        );
    }

    #[test]
    fn test_default_params() {
        let qc = find_module("pp.calculate_qc_metrics").unwrap().default_params();

        assert_eq!(qc.len(), 5);
        assert_eq!(qc.get("percent_top"), Some(&json!("")));
        assert!(find_module("pp.log1p").unwrap().default_params().is_empty());
    }
}
