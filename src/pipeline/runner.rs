use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::pipeline::backend::PreprocessingBackend;
use crate::pipeline::errors::PipelineError;
use crate::pipeline::instance::{ModuleKind, ModuleParams};
use crate::pipeline::params::ParamMap;

/// One node of a pipeline as sent by the UI
///
/// ### Fields
///
/// * `spec_id` - The module id, e.g. `"pp.filter_cells"`.
/// * `params` - Raw parameters of the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub spec_id: String,
    #[serde(default)]
    pub params: ParamMap,
}

/// An ordered, fully validated list of operations
#[derive(Clone, Debug, PartialEq)]
pub struct Pipeline {
    steps: Vec<(ModuleKind, ModuleParams)>,
}

impl Pipeline {
    /// Validate the steps
    ///
    /// Every id is resolved and every parameter map parsed up front, so a
    /// pipeline that builds cannot fail on its inputs half way through.
    ///
    /// ### Params
    ///
    /// * `steps` - The pipeline nodes in execution order.
    ///
    /// ### Returns
    ///
    /// The `Pipeline` or the first dispatch/coercion error.
    pub fn from_steps(steps: &[PipelineStep]) -> Result<Self, PipelineError> {
        let steps = steps
            .iter()
            .map(|step| {
                let kind: ModuleKind = step.spec_id.parse()?;
                let params = ModuleParams::parse(kind, &step.params)?;
                Ok((kind, params))
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;

        Ok(Self { steps })
    }

    /// Parse the steps from a JSON array and validate them
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let steps: Vec<PipelineStep> =
            serde_json::from_str(json).map_err(|e| PipelineError::InvalidSteps(e.to_string()))?;
        Self::from_steps(&steps)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The operations in execution order
    pub fn kinds(&self) -> Vec<ModuleKind> {
        self.steps.iter().map(|(kind, _)| *kind).collect()
    }

    /// Run all steps in order against the data
    ///
    /// Stops at the first failing step. Steps already applied stay applied.
    ///
    /// ### Params
    ///
    /// * `data` - The annotated data object, modified in place.
    /// * `backend` - The analysis library.
    pub fn run<B: PreprocessingBackend>(
        &self,
        data: &mut B::Data,
        backend: &B,
    ) -> Result<(), PipelineError> {
        let n = self.steps.len();
        for (i, (kind, params)) in self.steps.iter().enumerate() {
            let start = Instant::now();
            info!("step {}/{}: {}", i + 1, n, kind);
            params.apply(data, backend)?;
            debug!("{} done in {:.2?}", kind, start.elapsed());
        }
        Ok(())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::anndata::AnnotatedData;
    use crate::core::data::synthetic_data::{create_synthetic_adata, SyntheticCounts};
    use crate::pipeline::backend::NativeBackend;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_steps_from_ui_json() {
        let json = r#"[
            {"specId": "pp.filter_cells", "params": {"min_genes": "20"}},
            {"specId": "pp.log1p"}
        ]"#;
        let pipeline = Pipeline::from_json_str(json).unwrap();

        assert_eq!(
            pipeline.kinds(),
            vec![ModuleKind::FilterCells, ModuleKind::Log1p]
        );
    }

    #[test]
    fn test_validation_before_run() {
        let steps = vec![
            PipelineStep {
                spec_id: "pp.log1p".into(),
                params: ParamMap::default(),
            },
            PipelineStep {
                spec_id: "pp.nonexistent".into(),
                params: ParamMap::default(),
            },
        ];

        assert_eq!(
            Pipeline::from_steps(&steps),
            Err(PipelineError::UnknownModule("pp.nonexistent".into()))
        );
        assert!(matches!(
            Pipeline::from_json_str(r#"{"specId": "pp.log1p"}"#),
            Err(PipelineError::InvalidSteps(_))
        ));
    }

    #[test]
    fn test_native_pipeline_end_to_end() {
        init_logger();
        let params = SyntheticCounts::default();
        let (mut adata, _) = create_synthetic_adata(&params).unwrap();
        let json = r#"[
            {"specId": "pp.filter_cells", "params": {"min_genes": 50}},
            {"specId": "pp.filter_genes", "params": {"min_cells": "3"}},
            {"specId": "pp.calculate_qc_metrics", "params": {"percent_top": "", "log1p": true}},
            {"specId": "pp.normalize_total", "params": {"target_sum": "1e4"}},
            {"specId": "pp.log1p", "params": {}}
        ]"#;
        let pipeline = Pipeline::from_json_str(json).unwrap();

        pipeline.run(&mut adata, &NativeBackend::default()).unwrap();

        assert!(adata.n_obs() > 0 && adata.n_obs() <= 200);
        assert!(adata.n_vars() <= 600);
        assert!(adata.var.contains("mt"));
        assert!(adata.var.contains("n_cells_by_counts"));
        assert!(adata.obs.contains("pct_counts_mt"));
        assert!(adata.uns.contains_key("log1p"));

        let totals: Vec<f32> = (0..adata.n_obs())
            .map(|i| adata.dense_row(i).iter().map(|v| v.exp_m1()).sum())
            .collect();
        assert!(totals.iter().all(|t| (t - 1e4).abs() < 1.0));
    }

    #[test]
    fn test_run_stops_at_first_error() {
        let (mut adata, _) = create_synthetic_adata(&SyntheticCounts {
            n_cells: 20,
            n_genes: 50,
            ..Default::default()
        })
        .unwrap();
        let json = r#"[
            {"specId": "pp.log1p"},
            {"specId": "pp.scrublet", "params": {"batch_key": "sample"}},
            {"specId": "pp.log1p"}
        ]"#;
        let pipeline = Pipeline::from_json_str(json).unwrap();

        let res = pipeline.run(&mut adata, &NativeBackend::default());

        assert!(matches!(res, Err(PipelineError::Processing(_))));
        assert!(adata.uns.contains_key("log1p"));
    }
}
