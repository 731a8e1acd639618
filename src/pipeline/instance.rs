use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::core::data::anndata::{AnnotatedData, Column};
use crate::core::errors::ProcessingError;
use crate::pipeline::backend::{PreprocessingBackend, QcMetricsArgs};
use crate::pipeline::errors::PipelineError;
use crate::pipeline::params::*;
use crate::pipeline::registry::ModuleSpec;

static HB_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^HB[^(P)]").unwrap());

//////////
// Kind //
//////////

/// The operations the dispatch knows how to run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    FilterCells,
    FilterGenes,
    Scrublet,
    CalculateQcMetrics,
    NormalizeTotal,
    Log1p,
}

impl ModuleKind {
    pub fn id(&self) -> &'static str {
        match self {
            ModuleKind::FilterCells => "pp.filter_cells",
            ModuleKind::FilterGenes => "pp.filter_genes",
            ModuleKind::Scrublet => "pp.scrublet",
            ModuleKind::CalculateQcMetrics => "pp.calculate_qc_metrics",
            ModuleKind::NormalizeTotal => "pp.normalize_total",
            ModuleKind::Log1p => "pp.log1p",
        }
    }
}

impl FromStr for ModuleKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pp.filter_cells" => Ok(ModuleKind::FilterCells),
            "pp.filter_genes" => Ok(ModuleKind::FilterGenes),
            "pp.scrublet" => Ok(ModuleKind::Scrublet),
            "pp.calculate_qc_metrics" => Ok(ModuleKind::CalculateQcMetrics),
            "pp.normalize_total" => Ok(ModuleKind::NormalizeTotal),
            "pp.log1p" => Ok(ModuleKind::Log1p),
            other => Err(PipelineError::UnknownModule(other.to_string())),
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

////////////
// Params //
////////////

/// Validated parameters of one operation
#[derive(Clone, Debug, PartialEq)]
pub enum ModuleParams {
    FilterCells(FilterCellsParams),
    FilterGenes(FilterGenesParams),
    Scrublet(ScrubletStepParams),
    CalculateQcMetrics(QcMetricsParams),
    NormalizeTotal(NormalizeTotalParams),
    Log1p,
}

impl ModuleParams {
    /// Build the typed parameters of `kind` from a loosely-typed map
    ///
    /// ### Params
    ///
    /// * `kind` - The operation.
    /// * `map` - The raw parameters. Missing keys take their defaults.
    ///
    /// ### Returns
    ///
    /// The validated parameters or the first coercion failure.
    pub fn parse(kind: ModuleKind, map: &ParamMap) -> Result<Self, PipelineError> {
        let params = match kind {
            ModuleKind::FilterCells => {
                ModuleParams::FilterCells(FilterCellsParams::from_param_map(map)?)
            }
            ModuleKind::FilterGenes => {
                ModuleParams::FilterGenes(FilterGenesParams::from_param_map(map)?)
            }
            ModuleKind::Scrublet => ModuleParams::Scrublet(ScrubletStepParams::from_param_map(map)?),
            ModuleKind::CalculateQcMetrics => {
                ModuleParams::CalculateQcMetrics(QcMetricsParams::from_param_map(map)?)
            }
            ModuleKind::NormalizeTotal => {
                ModuleParams::NormalizeTotal(NormalizeTotalParams::from_param_map(map)?)
            }
            ModuleKind::Log1p => ModuleParams::Log1p,
        };
        Ok(params)
    }

    /// Execute the operation against the backend
    pub fn apply<B: PreprocessingBackend>(
        &self,
        data: &mut B::Data,
        backend: &B,
    ) -> Result<(), PipelineError> {
        match self {
            ModuleParams::FilterCells(p) => backend.filter_cells(data, p.min_genes)?,
            ModuleParams::FilterGenes(p) => backend.filter_genes(data, p.min_cells)?,
            ModuleParams::Scrublet(p) => backend.scrublet(data, p.batch_key.as_deref())?,
            ModuleParams::CalculateQcMetrics(p) => {
                check_percent_top(data, p)?;
                annotate_gene_flags(data, p)?;
                let args = QcMetricsArgs {
                    qc_vars: p.qc_vars(),
                    percent_top: p.percent_top.clone(),
                    log1p: p.log1p,
                };
                backend.calculate_qc_metrics(data, &args)?
            }
            ModuleParams::NormalizeTotal(p) => backend.normalize_total(data, p.target_sum)?,
            ModuleParams::Log1p => backend.log1p(data)?,
        }
        Ok(())
    }
}

////////////////
// Gene flags //
////////////////

/// Mitochondrial gene
pub fn is_mito_gene(name: &str) -> bool {
    name.starts_with("MT-")
}

/// Ribosomal protein gene
pub fn is_ribo_gene(name: &str) -> bool {
    name.starts_with("RPS") || name.starts_with("RPL")
}

/// Hemoglobin gene; the haptoglobin-like `HBP*` genes are excluded
pub fn is_hb_gene(name: &str) -> bool {
    HB_PATTERN.is_match(name)
}

/// Reject an explicit `percent_top` outside `1..=n_vars` before any column
/// is written
fn check_percent_top<D: AnnotatedData>(
    data: &D,
    params: &QcMetricsParams,
) -> Result<(), ProcessingError> {
    let n_vars = data.n_vars();
    if let Some(tops) = &params.percent_top {
        if let Some(&n) = tops.iter().find(|&&n| n < 1 || n as u64 > n_vars as u64) {
            return Err(ProcessingError::PercentTopOutOfRange { n, n_vars });
        }
    }
    Ok(())
}

/// Write the boolean `mt`, `ribo` and `hb` var columns for the enabled flags
fn annotate_gene_flags<D: AnnotatedData>(
    data: &mut D,
    params: &QcMetricsParams,
) -> Result<(), ProcessingError> {
    let flags: [(bool, &str, fn(&str) -> bool); 3] = [
        (params.use_mt, "mt", is_mito_gene),
        (params.use_ribo, "ribo", is_ribo_gene),
        (params.use_hb, "hb", is_hb_gene),
    ];

    for (enabled, key, predicate) in flags {
        if !enabled {
            continue;
        }
        let column: Vec<bool> = data.var_names().iter().map(|x| predicate(x)).collect();
        data.set_var_column(key, Column::Bool(column))?;
    }

    Ok(())
}

//////////////
// Instance //
//////////////

/// One configured pipeline node: a module descriptor plus its raw parameters
///
/// ### Fields
///
/// * `spec` - The module descriptor.
/// * `params` - Loosely-typed parameters as edited by the user.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleInstance {
    pub spec: ModuleSpec,
    pub params: ParamMap,
}

impl ModuleInstance {
    /// New instance starting from the descriptor's default parameters
    pub fn new(spec: ModuleSpec) -> Self {
        let params = spec.default_params();
        Self { spec, params }
    }

    /// New instance with explicit parameters
    pub fn with_params(spec: ModuleSpec, params: ParamMap) -> Self {
        Self { spec, params }
    }

    /// Resolve the operation behind the descriptor id
    pub fn kind(&self) -> Result<ModuleKind, PipelineError> {
        self.spec.id.parse()
    }

    /// Resolve the operation and validate the parameters
    pub fn parsed_params(&self) -> Result<ModuleParams, PipelineError> {
        ModuleParams::parse(self.kind()?, &self.params)
    }

    /// Run the module on the data, in place
    ///
    /// The id and all parameters are checked before the data is touched.
    ///
    /// ### Params
    ///
    /// * `data` - The annotated data object.
    /// * `backend` - The analysis library that does the work.
    pub fn run<B: PreprocessingBackend>(
        &self,
        data: &mut B::Data,
        backend: &B,
    ) -> Result<(), PipelineError> {
        let params = self.parsed_params()?;
        info!("running {}", self.spec.id);
        params.apply(data, backend)
    }
}

///////////
// Tests //
///////////
