use log::{info, warn};
use rayon::prelude::*;
use serde_json::json;
use statrs::statistics::{Data, Median};
use std::time::Instant;

use crate::core::data::anndata::{AnnData, AnnotatedData, Column};
use crate::core::errors::ProcessingError;

///////////
// Types //
///////////

/// Per-cell QC statistics
///
/// ### Fields
///
/// * `n_genes` - Number of genes with non-zero counts
/// * `total_counts` - Library size
/// * `top_pct` - Percentage of counts in the top n genes, one vector per n
/// * `qc_totals` - Total counts in each QC gene set
#[derive(Clone, Debug)]
struct CellQc {
    n_genes: usize,
    total_counts: f64,
    top_pct: Vec<f64>,
    qc_totals: Vec<f64>,
}

/////////////
// Helpers //
/////////////

/// Number of strictly positive entries per cell
fn expressed_genes_per_cell(adata: &AnnData) -> Vec<usize> {
    let x = adata.x();
    (0..x.n_major())
        .into_par_iter()
        .map(|i| x.major_slice(i).1.iter().filter(|&&v| v > 0.0).count())
        .collect()
}

/// Number of cells with strictly positive entries per gene
fn expressing_cells_per_gene(adata: &AnnData) -> Vec<usize> {
    let x = adata.x();
    let mut counts = vec![0_usize; adata.n_vars()];
    for (&j, &v) in x.indices.iter().zip(x.data.iter()) {
        if v > 0.0 {
            counts[j] += 1;
        }
    }
    counts
}

///////////////
// Filtering //
///////////////

/// Filter out cells with too few expressed genes
///
/// Adds the obs column `n_genes` for the retained cells.
///
/// ### Params
///
/// * `adata` - The annotated data, modified in place.
/// * `min_genes` - Minimum number of expressed genes for a cell to be kept.
pub fn filter_cells(adata: &mut AnnData, min_genes: i64) -> Result<(), ProcessingError> {
    let n_genes = expressed_genes_per_cell(adata);

    let keep: Vec<usize> = n_genes
        .iter()
        .enumerate()
        .filter(|(_, &n)| n as i64 >= min_genes)
        .map(|(i, _)| i)
        .collect();

    let n_removed = adata.n_obs() - keep.len();
    if n_removed > 0 {
        info!(
            "filtered out {} cells that have less than {} genes expressed",
            n_removed, min_genes
        );
    }

    let kept_counts: Vec<i64> = keep.iter().map(|&i| n_genes[i] as i64).collect();
    adata.subset_obs(&keep);
    adata.obs.insert("n_genes", Column::Int(kept_counts))?;

    Ok(())
}

/// Filter out genes detected in too few cells
///
/// Adds the var column `n_cells` for the retained genes.
///
/// ### Params
///
/// * `adata` - The annotated data, modified in place.
/// * `min_cells` - Minimum number of cells a gene needs to be expressed in.
pub fn filter_genes(adata: &mut AnnData, min_cells: i64) -> Result<(), ProcessingError> {
    let n_cells = expressing_cells_per_gene(adata);

    let keep: Vec<usize> = n_cells
        .iter()
        .enumerate()
        .filter(|(_, &n)| n as i64 >= min_cells)
        .map(|(i, _)| i)
        .collect();

    let n_removed = adata.n_vars() - keep.len();
    if n_removed > 0 {
        info!(
            "filtered out {} genes that are detected in less than {} cells",
            n_removed, min_cells
        );
    }

    let kept_counts: Vec<i64> = keep.iter().map(|&j| n_cells[j] as i64).collect();
    adata.subset_var(&keep);
    adata.var.insert("n_cells", Column::Int(kept_counts))?;

    Ok(())
}

///////////////////
// Normalisation //
///////////////////

/// Normalise every cell to the same total count
///
/// Cells without counts are left untouched.
///
/// ### Params
///
/// * `adata` - The annotated data, modified in place.
/// * `target_sum` - Total count every cell is scaled to. If `None`, the
///   median total count of the cells with non-zero counts is used.
pub fn normalize_total(
    adata: &mut AnnData,
    target_sum: Option<f64>,
) -> Result<(), ProcessingError> {
    let counts: Vec<f64> = adata
        .x()
        .major_sums()
        .iter()
        .map(|&c| c as f64)
        .collect();

    let target = match target_sum {
        Some(t) if t > 0.0 && t.is_finite() => t,
        Some(t) => return Err(ProcessingError::NonPositiveTargetSum(t)),
        None => {
            let non_zero: Vec<f64> = counts.iter().copied().filter(|&c| c > 0.0).collect();
            if non_zero.is_empty() {
                warn!("all cells have zero counts, skipping normalisation");
                return Ok(());
            }
            Data::new(non_zero).median()
        }
    };

    let factors: Vec<f32> = counts
        .iter()
        .map(|&c| if c > 0.0 { (target / c) as f32 } else { 1.0 })
        .collect();

    let indptr = adata.x().indptr.clone();
    let values = adata.x_values_mut();
    for (i, factor) in factors.iter().enumerate() {
        for v in &mut values[indptr[i]..indptr[i + 1]] {
            *v *= factor;
        }
    }

    info!("normalised counts per cell to {}", target);

    Ok(())
}

/// Logarithmise the data matrix, `x = ln(1 + x)`
///
/// Records `uns["log1p"]`. Warns if the data appears to be already
/// logarithmised.
///
/// ### Params
///
/// * `adata` - The annotated data, modified in place.
pub fn log1p(adata: &mut AnnData) -> Result<(), ProcessingError> {
    if adata.uns.contains_key("log1p") {
        warn!("adata.X seems to be already log-transformed");
    }

    adata
        .x_values_mut()
        .par_iter_mut()
        .for_each(|v| *v = v.ln_1p());

    adata.uns.insert("log1p".to_string(), json!({ "base": null }));

    Ok(())
}

////////////////
// QC metrics //
////////////////

/// Calculate the standard QC metrics for cells and genes
///
/// ### Params
///
/// * `adata` - The annotated data, modified in place.
/// * `qc_vars` - Names of boolean var columns marking gene sets (e.g. `"mt"`)
///   for which the proportion of counts is reported.
/// * `percent_top` - For each n, the percentage of counts in the top n genes
///   of every cell is reported. Every n must be in `1..=n_vars`.
/// * `log1p` - Shall the `log1p_*` variants of the metrics be added.
///
/// ### Returns
///
/// Adds to obs `n_genes_by_counts`, `total_counts`,
/// `pct_counts_in_top_{n}_genes` and `total_counts_{qc}` / `pct_counts_{qc}`;
/// adds to var `n_cells_by_counts`, `mean_counts`, `pct_dropout_by_counts`,
/// `total_counts`.
pub fn calculate_qc_metrics(
    adata: &mut AnnData,
    qc_vars: &[String],
    percent_top: &[i64],
    log1p: bool,
) -> Result<(), ProcessingError> {
    let start = Instant::now();
    let n_vars = adata.n_vars();
    let n_obs = adata.n_obs();

    let mut tops: Vec<usize> = Vec::with_capacity(percent_top.len());
    for &n in percent_top {
        if n < 1 || n as usize > n_vars {
            return Err(ProcessingError::PercentTopOutOfRange { n, n_vars });
        }
        tops.push(n as usize);
    }
    tops.sort_unstable();

    let mut qc_masks: Vec<&[bool]> = Vec::with_capacity(qc_vars.len());
    for qc in qc_vars {
        let mask = adata
            .var
            .get(qc)
            .ok_or_else(|| ProcessingError::MissingVarColumn(qc.clone()))?
            .as_bool()
            .ok_or_else(|| ProcessingError::NotBoolean(qc.clone()))?;
        qc_masks.push(mask);
    }

    let x = adata.x();
    let cell_qc: Vec<CellQc> = (0..n_obs)
        .into_par_iter()
        .map(|i| {
            let (idx, vals) = x.major_slice(i);
            let total_counts: f64 = vals.iter().map(|&v| v as f64).sum();
            let n_genes = vals.iter().filter(|&&v| v > 0.0).count();

            let mut sorted: Vec<f64> = vals.iter().map(|&v| v as f64).collect();
            sorted.sort_unstable_by(|a, b| b.total_cmp(a));
            let mut top_pct = Vec::with_capacity(tops.len());
            let mut cum = 0.0;
            let mut pos = 0;
            for &n in &tops {
                while pos < n.min(sorted.len()) {
                    cum += sorted[pos];
                    pos += 1;
                }
                top_pct.push(cum / total_counts * 100.0);
            }

            let qc_totals = qc_masks
                .iter()
                .map(|mask| {
                    idx.iter()
                        .zip(vals.iter())
                        .filter(|(&j, _)| mask[j])
                        .map(|(_, &v)| v as f64)
                        .sum()
                })
                .collect();

            CellQc {
                n_genes,
                total_counts,
                top_pct,
                qc_totals,
            }
        })
        .collect();

    let gene_totals: Vec<f64> = x.minor_sums().iter().map(|&v| v as f64).collect();
    let gene_n_cells = expressing_cells_per_gene(adata);

    // obs
    let n_genes: Vec<i64> = cell_qc.iter().map(|c| c.n_genes as i64).collect();
    let totals: Vec<f64> = cell_qc.iter().map(|c| c.total_counts).collect();
    let mut obs_cols: Vec<(String, Column)> = Vec::new();
    if log1p {
        let log_n_genes = n_genes.iter().map(|&n| (n as f64).ln_1p()).collect();
        obs_cols.push(("n_genes_by_counts".into(), Column::Int(n_genes)));
        obs_cols.push(("log1p_n_genes_by_counts".into(), Column::Float(log_n_genes)));
        obs_cols.push(("total_counts".into(), Column::Float(totals.clone())));
        obs_cols.push((
            "log1p_total_counts".into(),
            Column::Float(totals.iter().map(|t| t.ln_1p()).collect()),
        ));
    } else {
        obs_cols.push(("n_genes_by_counts".into(), Column::Int(n_genes)));
        obs_cols.push(("total_counts".into(), Column::Float(totals.clone())));
    }
    for (k, n) in tops.iter().enumerate() {
        obs_cols.push((
            format!("pct_counts_in_top_{}_genes", n),
            Column::Float(cell_qc.iter().map(|c| c.top_pct[k]).collect()),
        ));
    }
    for (k, qc) in qc_vars.iter().enumerate() {
        let qc_totals: Vec<f64> = cell_qc.iter().map(|c| c.qc_totals[k]).collect();
        let pct: Vec<f64> = qc_totals
            .iter()
            .zip(totals.iter())
            .map(|(q, t)| q / t * 100.0)
            .collect();
        if log1p {
            let log_totals = qc_totals.iter().map(|q| q.ln_1p()).collect();
            obs_cols.push((format!("total_counts_{}", qc), Column::Float(qc_totals)));
            obs_cols.push((format!("log1p_total_counts_{}", qc), Column::Float(log_totals)));
        } else {
            obs_cols.push((format!("total_counts_{}", qc), Column::Float(qc_totals)));
        }
        obs_cols.push((format!("pct_counts_{}", qc), Column::Float(pct)));
    }

    // var
    let mean_counts: Vec<f64> = gene_totals.iter().map(|t| t / n_obs as f64).collect();
    let dropout: Vec<f64> = gene_n_cells
        .iter()
        .map(|&n| (1.0 - n as f64 / n_obs as f64) * 100.0)
        .collect();
    let mut var_cols: Vec<(String, Column)> = vec![(
        "n_cells_by_counts".into(),
        Column::Int(gene_n_cells.iter().map(|&n| n as i64).collect()),
    )];
    var_cols.push(("mean_counts".into(), Column::Float(mean_counts.clone())));
    if log1p {
        var_cols.push((
            "log1p_mean_counts".into(),
            Column::Float(mean_counts.iter().map(|m| m.ln_1p()).collect()),
        ));
    }
    var_cols.push(("pct_dropout_by_counts".into(), Column::Float(dropout)));
    var_cols.push(("total_counts".into(), Column::Float(gene_totals.clone())));
    if log1p {
        var_cols.push((
            "log1p_total_counts".into(),
            Column::Float(gene_totals.iter().map(|t| t.ln_1p()).collect()),
        ));
    }

    for (key, col) in obs_cols {
        adata.obs.insert(&key, col)?;
    }
    for (key, col) in var_cols {
        adata.var.insert(&key, col)?;
    }

    info!(
        "calculated QC metrics for {} cells and {} genes in {:.2?}",
        n_obs,
        n_vars,
        start.elapsed()
    );

    Ok(())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    // 4 cells x 4 genes
    fn small_adata() -> AnnData {
        let rows = vec![
            vec![1.0, 0.0, 2.0, 0.0],
            vec![0.0, 3.0, 0.0, 0.0],
            vec![4.0, 1.0, 5.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0],
        ];
        AnnData::from_dense(&rows, names("cell_", 4), names("gene_", 4)).unwrap()
    }

    #[test]
    fn test_filter_cells() {
        let mut adata = small_adata();
        filter_cells(&mut adata, 2).unwrap();

        assert_eq!(adata.n_obs(), 2);
        assert_eq!(
            adata.obs_names(),
            &["cell_0".to_string(), "cell_2".to_string()]
        );
        assert_eq!(adata.obs.get("n_genes"), Some(&Column::Int(vec![2, 3])));
    }

    #[test]
    fn test_filter_genes() {
        let mut adata = small_adata();
        filter_genes(&mut adata, 2).unwrap();

        assert_eq!(adata.n_vars(), 3);
        assert_eq!(adata.var.get("n_cells"), Some(&Column::Int(vec![2, 2, 2])));
        assert_eq!(adata.dense_row(2), vec![4.0, 1.0, 5.0]);
    }

    #[test]
    fn test_normalize_total_target() {
        let mut adata = small_adata();
        normalize_total(&mut adata, Some(10.0)).unwrap();

        let sums = adata.x().major_sums();
        assert!((sums[0] - 10.0).abs() < 1e-5);
        assert!((sums[1] - 10.0).abs() < 1e-5);
        assert!((sums[2] - 10.0).abs() < 1e-5);
        assert_eq!(sums[3], 0.0);
    }

    #[test]
    fn test_normalize_total_median_default() {
        let mut adata = small_adata();
        // totals 3, 3, 10 -> median 3
        normalize_total(&mut adata, None).unwrap();

        let sums = adata.x().major_sums();
        assert!((sums[2] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_total_rejects_non_positive() {
        let mut adata = small_adata();
        let res = normalize_total(&mut adata, Some(0.0));

        assert_eq!(res, Err(ProcessingError::NonPositiveTargetSum(0.0)));
    }

    #[test]
    fn test_log1p() {
        let mut adata = small_adata();
        log1p(&mut adata).unwrap();

        assert!((adata.dense_row(1)[1] - 4.0_f32.ln()).abs() < 1e-6);
        assert_eq!(adata.uns.get("log1p"), Some(&json!({ "base": null })));
    }

    #[test]
    fn test_qc_metrics() {
        let mut adata = small_adata();
        adata
            .set_var_column("mt", Column::Bool(vec![true, false, false, false]))
            .unwrap();
        calculate_qc_metrics(&mut adata, &["mt".to_string()], &[1, 2], true).unwrap();

        assert_eq!(
            adata.obs.get("n_genes_by_counts"),
            Some(&Column::Int(vec![2, 1, 3, 0]))
        );
        let totals = adata.obs.get("total_counts").unwrap().as_float().unwrap();
        assert_eq!(totals, &[3.0, 3.0, 10.0, 0.0]);

        let top1 = adata
            .obs
            .get("pct_counts_in_top_1_genes")
            .unwrap()
            .as_float()
            .unwrap();
        assert!((top1[2] - 50.0).abs() < 1e-9);

        let pct_mt = adata.obs.get("pct_counts_mt").unwrap().as_float().unwrap();
        assert!((pct_mt[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!((pct_mt[2] - 40.0).abs() < 1e-9);
        assert!(adata.obs.contains("log1p_total_counts_mt"));

        assert_eq!(
            adata.var.get("n_cells_by_counts"),
            Some(&Column::Int(vec![2, 2, 2, 0]))
        );
        let dropout = adata
            .var
            .get("pct_dropout_by_counts")
            .unwrap()
            .as_float()
            .unwrap();
        assert_eq!(dropout, &[50.0, 50.0, 50.0, 100.0]);
    }

    #[test]
    fn test_qc_metrics_without_log1p() {
        let mut adata = small_adata();
        calculate_qc_metrics(&mut adata, &[], &[], false).unwrap();

        assert!(adata.obs.contains("total_counts"));
        assert!(!adata.obs.contains("log1p_total_counts"));
        assert!(!adata.var.contains("log1p_mean_counts"));
    }

    #[test]
    fn test_qc_metrics_percent_top_out_of_range() {
        let mut adata = small_adata();
        let res = calculate_qc_metrics(&mut adata, &[], &[5], true);

        assert_eq!(
            res,
            Err(ProcessingError::PercentTopOutOfRange { n: 5, n_vars: 4 })
        );
        assert!(!adata.obs.contains("total_counts"));
    }

    #[test]
    fn test_qc_metrics_missing_qc_var() {
        let mut adata = small_adata();
        let res = calculate_qc_metrics(&mut adata, &["ribo".to_string()], &[], true);

        assert_eq!(res, Err(ProcessingError::MissingVarColumn("ribo".into())));
    }
}
