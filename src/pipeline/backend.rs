use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::data::anndata::{AnnData, AnnotatedData};
use crate::core::errors::ProcessingError;
use crate::pipeline::params::{coerce_int_list, ParamMap};
use crate::single_cell::processing;
use crate::single_cell::scrublet::{scrublet, ScrubletParams};

///////////
// Trait //
///////////

/// Arguments of the QC metrics computation
///
/// ### Fields
///
/// * `qc_vars` - Names of the boolean var columns to report on.
/// * `percent_top` - If `None`, the backend applies its own default.
/// * `log1p` - Shall the `log1p_*` variants be computed.
#[derive(Clone, Debug, PartialEq)]
pub struct QcMetricsArgs {
    pub qc_vars: Vec<String>,
    pub percent_top: Option<Vec<i64>>,
    pub log1p: bool,
}

/// The analysis library the pipeline modules delegate to
///
/// Every operation mutates the data in place. Errors are returned as is to
/// the caller of the module.
pub trait PreprocessingBackend {
    type Data: AnnotatedData;

    fn filter_cells(&self, data: &mut Self::Data, min_genes: i64) -> Result<(), ProcessingError>;

    fn filter_genes(&self, data: &mut Self::Data, min_cells: i64) -> Result<(), ProcessingError>;

    fn scrublet(&self, data: &mut Self::Data, batch_key: Option<&str>)
        -> Result<(), ProcessingError>;

    fn calculate_qc_metrics(
        &self,
        data: &mut Self::Data,
        args: &QcMetricsArgs,
    ) -> Result<(), ProcessingError>;

    fn normalize_total(
        &self,
        data: &mut Self::Data,
        target_sum: Option<f64>,
    ) -> Result<(), ProcessingError>;

    fn log1p(&self, data: &mut Self::Data) -> Result<(), ProcessingError>;
}

////////////
// Config //
////////////

/// Configuration of the native backend
///
/// ### Fields
///
/// * `seed` - Seed for the stochastic steps (doublet simulation, SVD).
/// * `default_percent_top` - Used by the QC metrics when the caller does not
///   provide `percent_top`. Entries larger than the number of genes are
///   dropped.
/// * `scrublet` - Parameters of the doublet detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    pub seed: u64,
    pub default_percent_top: Vec<i64>,
    pub scrublet: ScrubletParams,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            default_percent_top: vec![50, 100, 200, 500],
            scrublet: ScrubletParams::default(),
        }
    }
}

impl NativeConfig {
    /// Parse the configuration from JSON; missing fields take the defaults
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Generate the configuration from a flat parameter map
    ///
    /// `seed` and `default_percent_top` are read directly, the Scrublet
    /// parameters are taken from the same map. Values that are missing or of
    /// the wrong type fall back to the defaults.
    ///
    /// ### Params
    ///
    /// * `map` - The parameter map.
    pub fn from_param_map(map: &ParamMap) -> Self {
        let default = Self::default();

        let seed = map
            .get("seed")
            .and_then(|v| v.as_u64())
            .unwrap_or(default.seed);

        let default_percent_top = map
            .get("default_percent_top")
            .and_then(|v| coerce_int_list(v).ok().flatten())
            .unwrap_or(default.default_percent_top);

        Self {
            seed,
            default_percent_top,
            scrublet: ScrubletParams::from_param_map(map),
        }
    }
}

////////////
// Native //
////////////

/// In-process backend over `AnnData`
#[derive(Clone, Debug, Default)]
pub struct NativeBackend {
    pub config: NativeConfig,
}

impl NativeBackend {
    pub fn new(config: NativeConfig) -> Self {
        Self { config }
    }
}

impl PreprocessingBackend for NativeBackend {
    type Data = AnnData;

    fn filter_cells(&self, data: &mut AnnData, min_genes: i64) -> Result<(), ProcessingError> {
        processing::filter_cells(data, min_genes)
    }

    fn filter_genes(&self, data: &mut AnnData, min_cells: i64) -> Result<(), ProcessingError> {
        processing::filter_genes(data, min_cells)
    }

    fn scrublet(&self, data: &mut AnnData, batch_key: Option<&str>) -> Result<(), ProcessingError> {
        scrublet(data, batch_key, &self.config.scrublet, self.config.seed)
    }

    fn calculate_qc_metrics(
        &self,
        data: &mut AnnData,
        args: &QcMetricsArgs,
    ) -> Result<(), ProcessingError> {
        let percent_top: Vec<i64> = match &args.percent_top {
            Some(tops) => tops.clone(),
            None => {
                let n_vars = data.n_vars() as i64;
                let tops: Vec<i64> = self
                    .config
                    .default_percent_top
                    .iter()
                    .copied()
                    .filter(|&n| n >= 1 && n <= n_vars)
                    .collect();
                debug!("using default percent_top {:?}", tops);
                tops
            }
        };

        processing::calculate_qc_metrics(data, &args.qc_vars, &percent_top, args.log1p)
    }

    fn normalize_total(
        &self,
        data: &mut AnnData,
        target_sum: Option<f64>,
    ) -> Result<(), ProcessingError> {
        processing::normalize_total(data, target_sum)
    }

    fn log1p(&self, data: &mut AnnData) -> Result<(), ProcessingError> {
        processing::log1p(data)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::anndata::Column;
    use crate::core::data::synthetic_data::{create_synthetic_adata, SyntheticCounts};
    use serde_json::json;

    fn small_adata() -> AnnData {
        let params = SyntheticCounts {
            n_cells: 60,
            n_genes: 120,
            ..Default::default()
        };
        create_synthetic_adata(&params).unwrap().0
    }

    #[test]
    fn test_config_from_json() {
        let config = NativeConfig::from_json_str(r#"{"seed": 7, "scrublet": {"no_pcs": 10}}"#)
            .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.scrublet.no_pcs, 10);
        assert_eq!(config.scrublet.n_bins, 50);
        assert_eq!(config.default_percent_top, vec![50, 100, 200, 500]);
    }

    #[test]
    fn test_config_from_param_map() {
        let map: ParamMap = [
            ("seed".to_string(), json!(3)),
            ("default_percent_top".to_string(), json!("10, 20")),
            ("no_pcs".to_string(), json!(5)),
        ]
        .into_iter()
        .collect();
        let config = NativeConfig::from_param_map(&map);

        assert_eq!(config.seed, 3);
        assert_eq!(config.default_percent_top, vec![10, 20]);
        assert_eq!(config.scrublet.no_pcs, 5);
    }

    #[test]
    fn test_default_percent_top_clipped_to_n_vars() {
        let backend = NativeBackend::default();
        let mut adata = small_adata();
        let args = QcMetricsArgs {
            qc_vars: Vec::new(),
            percent_top: None,
            log1p: false,
        };

        backend.calculate_qc_metrics(&mut adata, &args).unwrap();

        assert!(adata.obs.contains("pct_counts_in_top_50_genes"));
        assert!(adata.obs.contains("pct_counts_in_top_100_genes"));
        assert!(!adata.obs.contains("pct_counts_in_top_200_genes"));
        assert!(!adata.obs.contains("log1p_total_counts"));
    }

    #[test]
    fn test_explicit_percent_top_out_of_range() {
        let backend = NativeBackend::default();
        let mut adata = small_adata();
        let args = QcMetricsArgs {
            qc_vars: Vec::new(),
            percent_top: Some(vec![500]),
            log1p: true,
        };

        assert_eq!(
            backend.calculate_qc_metrics(&mut adata, &args),
            Err(ProcessingError::PercentTopOutOfRange { n: 500, n_vars: 120 })
        );
    }

    #[test]
    fn test_scrublet_missing_batch_column() {
        let backend = NativeBackend::default();
        let mut adata = small_adata();

        assert_eq!(
            backend.scrublet(&mut adata, Some("sample")),
            Err(ProcessingError::MissingObsColumn("sample".to_string()))
        );
    }

    #[test]
    fn test_scrublet_batches_with_max_seed() {
        let mut config = NativeConfig::from_json_str(r#"{"seed": 18446744073709551615}"#).unwrap();
        config.scrublet.no_pcs = 10;
        let backend = NativeBackend::new(config);
        let mut adata = small_adata();
        let samples = (0..adata.n_obs())
            .map(|i| if i < 30 { "a".to_string() } else { "b".to_string() })
            .collect();
        adata.obs.insert("sample", Column::Str(samples)).unwrap();

        assert_eq!(backend.config.seed, u64::MAX);
        assert!(backend.scrublet(&mut adata, Some("sample")).is_ok());
        assert!(adata.obs.contains("predicted_doublet"));
    }

    #[test]
    fn test_scrublet_with_batches() {
        let mut config = NativeConfig::default();
        config.scrublet.no_pcs = 10;
        let backend = NativeBackend::new(config);
        let mut adata = small_adata();
        let samples = (0..adata.n_obs())
            .map(|i| if i % 2 == 0 { "a".to_string() } else { "b".to_string() })
            .collect();
        adata.obs.insert("sample", Column::Str(samples)).unwrap();

        backend.scrublet(&mut adata, Some("sample")).unwrap();

        let scores = adata.obs.get("doublet_score").unwrap().as_float().unwrap();
        assert_eq!(scores.len(), 60);
        assert!(scores.iter().all(|s| s.is_finite() && *s >= 0.0));
        assert_eq!(adata.uns["scrublet"]["batch_key"], json!("sample"));
    }
}
