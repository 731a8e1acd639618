use faer::{concat, Mat};
use log::{debug, info};
use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::assert_same_len;
use crate::core::base::pca_svd::pca_on_scaled;
use crate::core::data::anndata::{AnnData, AnnotatedData, Column};
use crate::core::errors::ProcessingError;
use crate::core::graph::knn::generate_knn_exact;
use crate::pipeline::params::ParamMap;
use crate::utils::general::{array_max_min, group_by_label, moving_average};

///////////
// Types //
///////////

/// Type alias for Scrublet Doublet Scores
///
/// ### Fields
///
/// * `0` - Scores actual cells
/// * `1` - Errors actual cells
/// * `2` - Scores simulated cells
/// * `3` - Errors simulated cells
type ScrubletDoubletScores = (Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>);

/// Minimum number of cells per batch
const MIN_CELLS: usize = 3;

////////////////////////
// Params and results //
////////////////////////

/// Structure that stores the Scrublet parameters
///
/// ### Fields
///
/// **Gene selection:**
///
/// * `min_counts` - Genes need at least this many total counts.
/// * `min_cells` - Genes need to be expressed in at least this many cells.
/// * `min_gene_var_pctl` - Genes above this percentile of the Fano factor
///   are used as highly variable genes.
///
/// **Doublet generation:**
///
/// * `sim_doublet_ratio` - Number of doublets to simulate relative to the
///   number of observed cells.
/// * `expected_doublet_rate` - Expected doublet rate of the experiment.
/// * `stdev_doublet_rate` - Uncertainty of the expected doublet rate.
/// * `target_size` - Library size cells are normalised to before `ln(1+x)`.
///
/// **PCA and kNN:**
///
/// * `no_pcs` - Number of principal components.
/// * `random_svd` - Shall randomised SVD be used.
/// * `k` - Number of neighbours. If `None`, `round(0.5 * sqrt(n_cells))`.
///
/// **Calling:**
///
/// * `n_bins` - Number of histogram bins for the automatic threshold.
/// * `manual_threshold` - Optional fixed doublet score threshold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubletParams {
    pub min_counts: f32,
    pub min_cells: usize,
    pub min_gene_var_pctl: f32,
    pub sim_doublet_ratio: f32,
    pub expected_doublet_rate: f32,
    pub stdev_doublet_rate: f32,
    pub target_size: f32,
    pub no_pcs: usize,
    pub random_svd: bool,
    pub k: Option<usize>,
    pub n_bins: usize,
    pub manual_threshold: Option<f32>,
}

impl Default for ScrubletParams {
    fn default() -> Self {
        Self {
            min_counts: 3.0,
            min_cells: 3,
            min_gene_var_pctl: 0.85,
            sim_doublet_ratio: 2.0,
            expected_doublet_rate: 0.05,
            stdev_doublet_rate: 0.02,
            target_size: 1e6,
            no_pcs: 30,
            random_svd: false,
            k: None,
            n_bins: 50,
            manual_threshold: None,
        }
    }
}

impl ScrubletParams {
    /// Generate the ScrubletParams from a parameter map
    ///
    /// Values that are missing or of the wrong type fall back to the
    /// defaults.
    ///
    /// ### Params
    ///
    /// * `map` - The parameter map.
    ///
    /// ### Returns
    ///
    /// The `ScrubletParams` with all parameters set.
    pub fn from_param_map(map: &ParamMap) -> Self {
        let default = Self::default();

        let min_counts = map
            .get("min_counts")
            .and_then(|v| v.as_f64())
            .map(|x| x as f32)
            .unwrap_or(default.min_counts);

        let min_cells = map
            .get("min_cells")
            .and_then(|v| v.as_u64())
            .map(|x| x as usize)
            .unwrap_or(default.min_cells);

        let min_gene_var_pctl = map
            .get("min_gene_var_pctl")
            .and_then(|v| v.as_f64())
            .map(|x| x as f32)
            .unwrap_or(default.min_gene_var_pctl);

        let sim_doublet_ratio = map
            .get("sim_doublet_ratio")
            .and_then(|v| v.as_f64())
            .map(|x| x as f32)
            .unwrap_or(default.sim_doublet_ratio);

        let expected_doublet_rate = map
            .get("expected_doublet_rate")
            .and_then(|v| v.as_f64())
            .map(|x| x as f32)
            .unwrap_or(default.expected_doublet_rate);

        let stdev_doublet_rate = map
            .get("stdev_doublet_rate")
            .and_then(|v| v.as_f64())
            .map(|x| x as f32)
            .unwrap_or(default.stdev_doublet_rate);

        let target_size = map
            .get("target_size")
            .and_then(|v| v.as_f64())
            .map(|x| x as f32)
            .unwrap_or(default.target_size);

        let no_pcs = map
            .get("no_pcs")
            .and_then(|v| v.as_u64())
            .map(|x| x as usize)
            .unwrap_or(default.no_pcs);

        let random_svd = map
            .get("random_svd")
            .and_then(|v| v.as_bool())
            .unwrap_or(default.random_svd);

        let k = map
            .get("k")
            .and_then(|v| v.as_u64())
            .map(|x| x as usize);

        let n_bins = map
            .get("n_bins")
            .and_then(|v| v.as_u64())
            .map(|x| x as usize)
            .unwrap_or(default.n_bins);

        let manual_threshold = map
            .get("manual_threshold")
            .and_then(|v| v.as_f64())
            .map(|x| x as f32);

        Self {
            min_counts,
            min_cells,
            min_gene_var_pctl,
            sim_doublet_ratio,
            expected_doublet_rate,
            stdev_doublet_rate,
            target_size,
            no_pcs,
            random_svd,
            k,
            n_bins,
            manual_threshold,
        }
    }
}

/// Result structure for Scrublet on one batch
#[derive(Clone, Debug)]
pub struct ScrubletResult {
    pub predicted_doublets: Vec<bool>,
    pub doublet_scores_obs: Vec<f32>,
    pub doublet_scores_sim: Vec<f32>,
    pub doublet_errors_obs: Vec<f32>,
    pub z_scores: Vec<f32>,
    pub threshold: f32,
    pub detected_doublet_rate: f32,
    pub detectable_doublet_fraction: f32,
    pub overall_doublet_rate: f32,
}

/// Summary per batch stored in `uns["scrublet"]`
#[derive(Clone, Debug, Serialize)]
struct BatchSummary {
    batch: String,
    n_cells: usize,
    threshold: f32,
    detected_doublet_rate: f32,
    detectable_doublet_fraction: f32,
    overall_doublet_rate: f32,
}

/////////////
// Helpers //
/////////////

/// Raw counts of one cell (observed or simulated)
///
/// ### Fields
///
/// * `indices` - Gene indices with non-zero counts (sorted).
/// * `data_raw` - The raw counts.
/// * `library_size` - Total counts over all genes.
#[derive(Clone, Debug)]
struct CellCounts {
    indices: Vec<usize>,
    data_raw: Vec<f32>,
    library_size: f32,
}

impl CellCounts {
    /// Read one cell from the count matrix
    fn from_adata(adata: &AnnData, cell: usize) -> Self {
        let (idx, vals) = adata.x().major_slice(cell);
        Self {
            indices: idx.to_vec(),
            data_raw: vals.to_vec(),
            library_size: vals.iter().sum(),
        }
    }

    /// Add two cells together for the doublet simulation
    ///
    /// Counts of the highly variable genes are added, the library size is
    /// the combined library size over all genes.
    ///
    /// ### Params
    ///
    /// * `cell1` - First cell
    /// * `cell2` - Second cell
    /// * `hvg_set` - Set of HVG gene indices to keep
    fn add_cells_scrublet(cell1: &Self, cell2: &Self, hvg_set: &FxHashSet<usize>) -> Self {
        let mut gene_counts: FxHashMap<usize, f32> = FxHashMap::default();

        for cell in [cell1, cell2] {
            for (&gene, &count) in cell.indices.iter().zip(cell.data_raw.iter()) {
                if hvg_set.contains(&gene) {
                    *gene_counts.entry(gene).or_insert(0.0) += count;
                }
            }
        }

        let mut gene_vec: Vec<(usize, f32)> = gene_counts.into_iter().collect();
        gene_vec.sort_unstable_by_key(|&(gene, _)| gene);
        let (indices, data_raw) = gene_vec.into_iter().unzip();

        Self {
            indices,
            data_raw,
            library_size: cell1.library_size + cell2.library_size,
        }
    }

    /// Normalised and z-scored values of this cell on the HVG space
    ///
    /// ### Params
    ///
    /// * `hvg_pos` - Map from gene index to position in the HVG space.
    /// * `target_size` - Library size to normalise to before `ln(1+x)`.
    /// * `gene_means` - Per-HVG mean of the observed cells.
    /// * `gene_stds` - Per-HVG standard deviation of the observed cells.
    fn scaled_row(
        &self,
        hvg_pos: &FxHashMap<usize, usize>,
        target_size: f32,
        gene_means: &[f32],
        gene_stds: &[f32],
    ) -> Vec<f32> {
        let n_genes = gene_means.len();
        let mut row: Vec<f32> = (0..n_genes)
            .map(|g| -gene_means[g] / gene_stds[g])
            .collect();
        let norm_factor = if self.library_size > 0.0 {
            target_size / self.library_size
        } else {
            0.0
        };
        for (gene, &count) in self.indices.iter().zip(self.data_raw.iter()) {
            if let Some(&pos) = hvg_pos.get(gene) {
                let val = (count * norm_factor).ln_1p();
                row[pos] = (val - gene_means[pos]) / gene_stds[pos];
            }
        }
        row
    }
}

/// Equal-width histogram over the simulated doublet scores
///
/// ### Fields
///
/// * `min` - Lower edge of the first bin.
/// * `bin_width` - Width of every bin.
/// * `counts` - Number of scores per bin.
#[derive(Clone, Debug)]
struct ScoreHistogram {
    min: f32,
    bin_width: f32,
    counts: Vec<usize>,
}

impl ScoreHistogram {
    /// Bin the scores; `None` if all scores (nearly) coincide
    fn new(scores: &[f32], n_bins: usize) -> Option<Self> {
        let (min, max) = array_max_min(scores);
        if (max - min).abs() < 1e-6 {
            return None;
        }
        let bin_width = (max - min) / n_bins as f32;
        let mut counts = vec![0_usize; n_bins];
        for &score in scores {
            let bin = (((score - min) / bin_width).floor() as usize).min(n_bins - 1);
            counts[bin] += 1;
        }
        Some(Self {
            min,
            bin_width,
            counts,
        })
    }

    fn bin_centre(&self, bin: usize) -> f32 {
        self.min + (bin as f32 + 0.5) * self.bin_width
    }

    /// Lowest smoothed bin between the first peak and the rise to the next one
    ///
    /// The first peak is the first bin above 10% of the highest smoothed
    /// count. The search stops once a bin exceeds 1.5 times the running
    /// minimum.
    fn valley(&self) -> Option<usize> {
        let smoothed = moving_average(&self.counts, 3);
        let peak_floor = smoothed.iter().max().map_or(0, |&m| (m as f32 * 0.1) as usize);
        let first_peak = smoothed.iter().position(|&c| c > peak_floor)?;

        let mut valley: Option<(usize, usize)> = None;
        for (bin, &count) in smoothed.iter().enumerate().skip(first_peak + 1) {
            let lowest = match valley {
                Some((_, low)) if low <= count => low,
                _ => {
                    valley = Some((bin, count));
                    count
                }
            };
            if count > (lowest as f32 * 1.5) as usize {
                break;
            }
        }

        valley.map(|(bin, _)| bin)
    }
}

/// Find the threshold at the valley of the simulated score histogram
///
/// ### Params
///
/// * `scores` - Doublet scores of the simulated doublets. Must not be empty.
/// * `n_bins` - Number of histogram bins.
///
/// ### Returns
///
/// The centre of the valley bin. The midpoint if all scores are equal, the
/// median of the scores if no valley is found.
pub fn find_threshold_min(scores: &[f32], n_bins: usize) -> f32 {
    let Some(hist) = ScoreHistogram::new(scores, n_bins.max(1)) else {
        let (min, max) = array_max_min(scores);
        return (min + max) / 2.0;
    };

    match hist.valley() {
        Some(bin) => hist.bin_centre(bin),
        None => {
            let mut sorted = scores.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            sorted[sorted.len() / 2]
        }
    }
}

////////////////////
// Main structure //
////////////////////

/// Scrublet doublet detection on one batch of cells
#[derive(Clone, Debug)]
pub struct Scrublet<'a> {
    adata: &'a AnnData,
    params: ScrubletParams,
    batch: String,
    cells: Vec<usize>,
    n_cells_sim: usize,
}

impl<'a> Scrublet<'a> {
    /// Generate a new instance
    ///
    /// ### Params
    ///
    /// * `adata` - The annotated data with raw counts.
    /// * `params` - The Scrublet parameters.
    /// * `batch` - Name of the batch, used in messages.
    /// * `cells` - Indices of the cells in this batch.
    pub fn new(adata: &'a AnnData, params: ScrubletParams, batch: &str, cells: &[usize]) -> Self {
        Self {
            adata,
            params,
            batch: batch.to_string(),
            cells: cells.to_vec(),
            n_cells_sim: 0,
        }
    }

    /// Run the full Scrublet workflow
    ///
    /// ### Params
    ///
    /// * `seed` - Seed for the doublet simulation and randomised SVD.
    ///
    /// ### Returns
    ///
    /// The `ScrubletResult` for the cells of this batch, in the order they
    /// were provided.
    pub fn run_scrublet(&mut self, seed: u64) -> Result<ScrubletResult, ProcessingError> {
        let n_cells = self.cells.len();
        if n_cells < MIN_CELLS {
            return Err(ProcessingError::InsufficientCells {
                batch: self.batch.clone(),
                n_cells,
                min: MIN_CELLS,
            });
        }
        let start_all = Instant::now();

        let obs_cells: Vec<CellCounts> = self
            .cells
            .par_iter()
            .map(|&i| CellCounts::from_adata(self.adata, i))
            .collect();

        let start_hvg = Instant::now();
        let hvg_genes = self.get_hvg(&obs_cells)?;
        debug!(
            "using {} highly variable genes. Done in {:.2?}",
            hvg_genes.len(),
            start_hvg.elapsed()
        );

        let start_doublet_gen = Instant::now();
        let sim_cells = self.simulate_doublets(&obs_cells, &hvg_genes, seed);
        debug!(
            "simulated {} doublets. Done in {:.2?}",
            sim_cells.len(),
            start_doublet_gen.elapsed()
        );

        let start_pca = Instant::now();
        let combined_pca = self.run_pca(&obs_cells, &sim_cells, &hvg_genes, seed)?;
        debug!("done with PCA in {:.2?}", start_pca.elapsed());

        let start_knn = Instant::now();
        let knn_indices = generate_knn_exact(combined_pca.as_ref(), self.k_adjusted());
        debug!("done with kNN generation in {:.2?}", start_knn.elapsed());

        let doublet_scores = self.calculate_doublet_scores(&knn_indices);
        let res = self.call_doublets(doublet_scores);

        info!(
            "finished Scrublet on batch `{}` ({} cells) in {:.2?}",
            self.batch,
            n_cells,
            start_all.elapsed()
        );

        Ok(res)
    }

    /// Number of neighbours on the combined observed + simulated data
    fn k_adjusted(&self) -> usize {
        let n_obs = self.cells.len();
        let k = self
            .params
            .k
            .unwrap_or_else(|| (0.5 * (n_obs as f32).sqrt()).round() as usize)
            .max(1);
        let r = self.n_cells_sim as f32 / n_obs as f32;
        ((k as f32 * (1.0 + r)).round() as usize).max(1)
    }

    /// Get the indices of the highly variable genes
    ///
    /// Genes passing the count filters are ranked by the Fano factor of their
    /// library size normalised counts and the top percentile is kept.
    fn get_hvg(&self, obs_cells: &[CellCounts]) -> Result<Vec<usize>, ProcessingError> {
        let n_genes = self.adata.n_vars();
        let n_cells = obs_cells.len() as f64;

        let mut raw_totals = vec![0.0_f64; n_genes];
        let mut n_expressed = vec![0_usize; n_genes];
        let mut sums = vec![0.0_f64; n_genes];
        let mut sum_sq = vec![0.0_f64; n_genes];

        for cell in obs_cells {
            if cell.library_size <= 0.0 {
                continue;
            }
            let factor = (self.params.target_size / cell.library_size) as f64;
            for (&gene, &count) in cell.indices.iter().zip(cell.data_raw.iter()) {
                let norm = count as f64 * factor;
                raw_totals[gene] += count as f64;
                if count > 0.0 {
                    n_expressed[gene] += 1;
                }
                sums[gene] += norm;
                sum_sq[gene] += norm * norm;
            }
        }

        let mut candidates: Vec<(usize, f64)> = (0..n_genes)
            .filter(|&g| {
                raw_totals[g] >= self.params.min_counts as f64
                    && n_expressed[g] >= self.params.min_cells
            })
            .map(|g| {
                let mean = sums[g] / n_cells;
                let var = (sum_sq[g] / n_cells - mean * mean).max(0.0);
                let fano = if mean > 0.0 { var / mean } else { 0.0 };
                (g, fano)
            })
            .collect();

        if candidates.is_empty() {
            return Err(ProcessingError::NoVariableGenes(self.batch.clone()));
        }

        let pctl = self.params.min_gene_var_pctl.clamp(0.0, 1.0) as f64;
        let n_to_take = ((candidates.len() as f64 * (1.0 - pctl)).ceil() as usize)
            .clamp(1, candidates.len());

        candidates.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        candidates.truncate(n_to_take);

        let mut hvg: Vec<usize> = candidates.into_iter().map(|(g, _)| g).collect();
        hvg.sort_unstable();

        Ok(hvg)
    }

    /// Generate a vector of doublets from random pairs of observed cells
    fn simulate_doublets(
        &mut self,
        obs_cells: &[CellCounts],
        hvg_genes: &[usize],
        seed: u64,
    ) -> Vec<CellCounts> {
        let n_obs = obs_cells.len();
        let n_sim_doublets = ((n_obs as f32 * self.params.sim_doublet_ratio) as usize).max(1);
        self.n_cells_sim = n_sim_doublets;
        let mut rng = StdRng::seed_from_u64(seed);

        let pairs: Vec<(usize, usize)> = (0..n_sim_doublets)
            .map(|_| (rng.random_range(0..n_obs), rng.random_range(0..n_obs)))
            .collect();

        let hvg_set: FxHashSet<usize> = hvg_genes.iter().copied().collect();

        pairs
            .par_iter()
            .map(|&(i, j)| CellCounts::add_cells_scrublet(&obs_cells[i], &obs_cells[j], &hvg_set))
            .collect()
    }

    /// Run the PCA on the observed cells and project the simulated doublets
    ///
    /// The simulated doublets are scaled with the statistics of the observed
    /// cells.
    ///
    /// ### Returns
    ///
    /// The combined embedding with the observed cells first.
    fn run_pca(
        &self,
        obs_cells: &[CellCounts],
        sim_cells: &[CellCounts],
        hvg_genes: &[usize],
        seed: u64,
    ) -> Result<Mat<f32>, ProcessingError> {
        let n_hvg = hvg_genes.len();
        let n_obs = obs_cells.len() as f32;
        let hvg_pos: FxHashMap<usize, usize> = hvg_genes
            .iter()
            .enumerate()
            .map(|(pos, &gene)| (gene, pos))
            .collect();

        // gene statistics on the log-normalised observed data
        let zeros = vec![0.0_f32; n_hvg];
        let ones = vec![1.0_f32; n_hvg];
        let log_obs: Vec<Vec<f32>> = obs_cells
            .par_iter()
            .map(|c| c.scaled_row(&hvg_pos, self.params.target_size, &zeros, &ones))
            .collect();

        let mut means = vec![0.0_f32; n_hvg];
        for row in &log_obs {
            for (m, v) in means.iter_mut().zip(row.iter()) {
                *m += v;
            }
        }
        means.iter_mut().for_each(|m| *m /= n_obs);

        let mut stds = vec![0.0_f32; n_hvg];
        for row in &log_obs {
            for ((s, v), m) in stds.iter_mut().zip(row.iter()).zip(means.iter()) {
                *s += (v - m) * (v - m);
            }
        }
        stds.iter_mut().for_each(|s| {
            let sd = (*s / (n_obs - 1.0).max(1.0)).sqrt();
            *s = if sd > 1e-8 { sd } else { 1.0 };
        });

        let scaled_obs = Mat::from_fn(log_obs.len(), n_hvg, |i, j| {
            (log_obs[i][j] - means[j]) / stds[j]
        });

        let pca_res = pca_on_scaled(
            scaled_obs.as_ref(),
            self.params.no_pcs,
            self.params.random_svd,
            seed,
        )?;

        let sim_rows: Vec<Vec<f32>> = sim_cells
            .par_iter()
            .map(|c| c.scaled_row(&hvg_pos, self.params.target_size, &means, &stds))
            .collect();
        let scaled_sim = Mat::from_fn(sim_rows.len(), n_hvg, |i, j| sim_rows[i][j]);

        let pca_sim = &scaled_sim * &pca_res.loadings;

        Ok(concat![[pca_res.scores], [pca_sim]])
    }

    /// Calculate the doublet scores
    fn calculate_doublet_scores(&self, knn_indices: &[Vec<usize>]) -> ScrubletDoubletScores {
        let n_obs = self.cells.len();
        let n_sim = self.n_cells_sim;

        let r = n_sim as f32 / n_obs as f32;
        let rho = self.params.expected_doublet_rate;
        let se_rho = self.params.stdev_doublet_rate;

        let scores_errors: Vec<(f32, f32)> = knn_indices
            .par_iter()
            .map(|neighbours| {
                let n_adj = neighbours.len() as f32;
                let n_sim_neigh = neighbours.iter().filter(|&&idx| idx >= n_obs).count() as f32;
                let q = (n_sim_neigh + 1.0) / (n_adj + 2.0);
                let denominator = 1.0 - rho - q * (1.0 - rho - rho / r);
                let score = if denominator.abs() > 1e-10 {
                    (q * rho / r) / denominator
                } else {
                    0.0
                };

                let se_q = (q * (1.0 - q) / (n_adj + 3.0)).sqrt();
                let factor = q * rho / r / (denominator * denominator);
                let se_score = factor
                    * ((se_q / q * (1.0 - rho)).powi(2) + (se_rho / rho * (1.0 - q)).powi(2))
                        .sqrt();

                (score.max(0.0), se_score.max(1e-10))
            })
            .collect();

        let (scores_obs, errors_obs): (Vec<f32>, Vec<f32>) =
            scores_errors[..n_obs].iter().copied().unzip();

        let (scores_sim, errors_sim): (Vec<f32>, Vec<f32>) =
            scores_errors[n_obs..].iter().copied().unzip();

        (scores_obs, errors_obs, scores_sim, errors_sim)
    }

    /// Call the doublets from the scores
    fn call_doublets(&self, doublet_scores: ScrubletDoubletScores) -> ScrubletResult {
        assert_same_len!(doublet_scores.0, doublet_scores.1);

        let threshold = self.params.manual_threshold.unwrap_or_else(|| {
            let t = find_threshold_min(&doublet_scores.2, self.params.n_bins);
            debug!("automatically set threshold at doublet score = {:.4}", t);
            t
        });

        let predicted_doublets: Vec<bool> = doublet_scores
            .0
            .iter()
            .map(|&score| score > threshold)
            .collect();

        let z_scores: Vec<f32> = doublet_scores
            .0
            .iter()
            .zip(doublet_scores.1.iter())
            .map(|(&score, &error)| (score - threshold) / error)
            .collect();

        let n_detected = predicted_doublets.iter().filter(|&&x| x).count();
        let detected_doublet_rate = n_detected as f32 / doublet_scores.0.len() as f32;

        let n_detectable = doublet_scores.2.iter().filter(|&&s| s > threshold).count();
        let detectable_doublet_fraction = n_detectable as f32 / doublet_scores.2.len() as f32;

        let overall_doublet_rate = if detectable_doublet_fraction > 0.01 {
            detected_doublet_rate / detectable_doublet_fraction
        } else {
            0.0
        };

        info!(
            "batch `{}`: detected doublet rate = {:.1}%, detectable fraction = {:.1}%, \
             expected rate = {:.1}%, estimated rate = {:.1}%",
            self.batch,
            100.0 * detected_doublet_rate,
            100.0 * detectable_doublet_fraction,
            100.0 * self.params.expected_doublet_rate,
            100.0 * overall_doublet_rate
        );

        ScrubletResult {
            predicted_doublets,
            doublet_scores_obs: doublet_scores.0,
            doublet_scores_sim: doublet_scores.2,
            doublet_errors_obs: doublet_scores.1,
            z_scores,
            threshold,
            detected_doublet_rate,
            detectable_doublet_fraction,
            overall_doublet_rate,
        }
    }
}

/////////////////
// Entry point //
/////////////////

/// Run Scrublet on the annotated data, optionally per batch
///
/// Adds obs `doublet_score` and `predicted_doublet` and stores the per-batch
/// thresholds and rates in `uns["scrublet"]`.
///
/// ### Params
///
/// * `adata` - The annotated data with raw counts, modified in place.
/// * `batch_key` - Optional obs column. Scrublet runs separately per value.
/// * `params` - The Scrublet parameters.
/// * `seed` - Seed for reproducibility. Batch `i` uses `seed + i`,
///   wrapping on overflow.
pub fn scrublet(
    adata: &mut AnnData,
    batch_key: Option<&str>,
    params: &ScrubletParams,
    seed: u64,
) -> Result<(), ProcessingError> {
    let n_obs = adata.n_obs();

    let batches: Vec<(String, Vec<usize>)> = match batch_key {
        Some(key) => {
            let column = adata
                .obs
                .get(key)
                .ok_or_else(|| ProcessingError::MissingObsColumn(key.to_string()))?;
            group_by_label(&column.labels())
        }
        None => vec![("all".to_string(), (0..n_obs).collect())],
    };

    let mut doublet_score = vec![0.0_f64; n_obs];
    let mut predicted_doublet = vec![false; n_obs];
    let mut summaries = Vec::with_capacity(batches.len());

    for (batch_idx, (batch, cells)) in batches.iter().enumerate() {
        let mut scrub = Scrublet::new(adata, params.clone(), batch, cells);
        let res = scrub.run_scrublet(seed.wrapping_add(batch_idx as u64))?;

        for (pos, &cell) in cells.iter().enumerate() {
            doublet_score[cell] = res.doublet_scores_obs[pos] as f64;
            predicted_doublet[cell] = res.predicted_doublets[pos];
        }
        summaries.push(BatchSummary {
            batch: batch.clone(),
            n_cells: cells.len(),
            threshold: res.threshold,
            detected_doublet_rate: res.detected_doublet_rate,
            detectable_doublet_fraction: res.detectable_doublet_fraction,
            overall_doublet_rate: res.overall_doublet_rate,
        });
    }

    adata
        .obs
        .insert("doublet_score", Column::Float(doublet_score))?;
    adata
        .obs
        .insert("predicted_doublet", Column::Bool(predicted_doublet))?;
    adata.uns.insert(
        "scrublet".to_string(),
        serde_json::json!({
            "batch_key": batch_key,
            "batches": summaries,
            "parameters": params,
        }),
    );

    Ok(())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{create_synthetic_adata, SyntheticCounts};

    fn synthetic(n_cells: usize) -> AnnData {
        let params = SyntheticCounts {
            n_cells,
            n_genes: 200,
            ..Default::default()
        };
        create_synthetic_adata(&params).unwrap().0
    }

    #[test]
    fn test_threshold_constant_scores() {
        assert_eq!(find_threshold_min(&[0.2, 0.2, 0.2], 10), 0.2);
    }

    #[test]
    fn test_threshold_bimodal() {
        let mut scores = vec![0.05_f32; 80];
        scores.extend(vec![0.9_f32; 20]);
        let t = find_threshold_min(&scores, 20);

        assert!(t > 0.05 && t < 0.9, "threshold {} not between modes", t);
    }

    #[test]
    fn test_histogram_valley_between_modes() {
        let mut scores = vec![0.0_f32; 50];
        scores.extend(vec![0.5_f32; 5]);
        scores.extend(vec![1.0_f32; 30]);
        let hist = ScoreHistogram::new(&scores, 10).unwrap();

        assert_eq!(hist.counts.iter().sum::<usize>(), 85);
        assert_eq!(hist.counts[0], 50);
        assert_eq!(hist.counts[9], 30);
        let valley = hist.valley().unwrap();
        assert!(valley > 0 && valley < 9);
        assert!(ScoreHistogram::new(&[0.3, 0.3], 10).is_none());
    }

    #[test]
    fn test_add_cells_keeps_hvg_and_library() {
        let c1 = CellCounts {
            indices: vec![0, 2, 5],
            data_raw: vec![1.0, 2.0, 3.0],
            library_size: 6.0,
        };
        let c2 = CellCounts {
            indices: vec![2, 3],
            data_raw: vec![4.0, 1.0],
            library_size: 5.0,
        };
        let hvg: FxHashSet<usize> = [2, 3].into_iter().collect();
        let doublet = CellCounts::add_cells_scrublet(&c1, &c2, &hvg);

        assert_eq!(doublet.indices, vec![2, 3]);
        assert_eq!(doublet.data_raw, vec![6.0, 1.0]);
        assert_eq!(doublet.library_size, 11.0);
    }

    #[test]
    fn test_from_param_map_defaults() {
        let mut map = ParamMap::default();
        map.insert("no_pcs".into(), serde_json::json!(10));
        map.insert("random_svd".into(), serde_json::json!("yes"));
        let params = ScrubletParams::from_param_map(&map);

        assert_eq!(params.no_pcs, 10);
        assert!(!params.random_svd);
        assert_eq!(params.sim_doublet_ratio, 2.0);
    }

    #[test]
    fn test_scrublet_adds_columns() {
        let mut adata = synthetic(60);
        scrublet(&mut adata, None, &ScrubletParams::default(), 42).unwrap();

        let scores = adata.obs.get("doublet_score").unwrap().as_float().unwrap();
        assert_eq!(scores.len(), 60);
        assert!(scores.iter().all(|s| s.is_finite() && *s >= 0.0));
        assert!(adata.obs.get("predicted_doublet").unwrap().as_bool().is_some());
        assert!(adata.uns.contains_key("scrublet"));
    }

    #[test]
    fn test_scrublet_deterministic() {
        let mut a = synthetic(40);
        let mut b = synthetic(40);
        scrublet(&mut a, None, &ScrubletParams::default(), 7).unwrap();
        scrublet(&mut b, None, &ScrubletParams::default(), 7).unwrap();

        assert_eq!(a.obs.get("doublet_score"), b.obs.get("doublet_score"));
    }

    #[test]
    fn test_scrublet_per_batch() {
        let mut adata = synthetic(60);
        let batches = (0..60)
            .map(|i| if i < 30 { "s1".to_string() } else { "s2".to_string() })
            .collect();
        adata.obs.insert("sample", Column::Str(batches)).unwrap();

        scrublet(&mut adata, Some("sample"), &ScrubletParams::default(), 42).unwrap();

        let summary = &adata.uns["scrublet"]["batches"];
        assert_eq!(summary.as_array().map(|b| b.len()), Some(2));
        assert_eq!(summary[0]["batch"], "s1");
    }

    #[test]
    fn test_scrublet_batches_with_max_seed() {
        let mut adata = synthetic(40);
        let batches = (0..40)
            .map(|i| if i % 2 == 0 { "s1".to_string() } else { "s2".to_string() })
            .collect();
        adata.obs.insert("sample", Column::Str(batches)).unwrap();

        scrublet(&mut adata, Some("sample"), &ScrubletParams::default(), u64::MAX).unwrap();

        let scores = adata.obs.get("doublet_score").unwrap().as_float().unwrap();
        assert_eq!(scores.len(), 40);
        assert!(scores.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_scrublet_missing_batch_column() {
        let mut adata = synthetic(20);
        let res = scrublet(&mut adata, Some("sample"), &ScrubletParams::default(), 42);

        assert_eq!(res, Err(ProcessingError::MissingObsColumn("sample".into())));
        assert!(!adata.obs.contains("doublet_score"));
    }

    #[test]
    fn test_scrublet_too_few_cells() {
        let mut adata = synthetic(2);
        let res = scrublet(&mut adata, None, &ScrubletParams::default(), 42);

        assert!(matches!(
            res,
            Err(ProcessingError::InsufficientCells { n_cells: 2, .. })
        ));
    }
}
