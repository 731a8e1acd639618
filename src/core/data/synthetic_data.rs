use rand::prelude::*;
use rand_distr::weighted::WeightedAliasIndex;
use rand_distr::{Distribution, Poisson};

use crate::core::data::anndata::AnnData;
use crate::core::data::sparse_structures::CompressedSparseData;
use crate::core::errors::ProcessingError;

////////////
// Params //
////////////

/// Structure to keep the parameters of a synthetic count matrix
///
/// ### Fields
///
/// * `n_cells` - Number of cells (rows).
/// * `n_genes` - Number of genes (columns). The first genes get QC-relevant
///   names (`MT-`, `RPS`/`RPL`, `HB`), see `synthetic_gene_names()`.
/// * `n_cell_types` - Number of cell types. Each cell type gets a block of
///   marker genes with elevated expression.
/// * `genes_per_cell` - `(min, max)` number of background genes sampled per
///   cell.
/// * `marker_lambda` - Poisson mean of the marker gene counts.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug)]
pub struct SyntheticCounts {
    pub n_cells: usize,
    pub n_genes: usize,
    pub n_cell_types: usize,
    pub genes_per_cell: (usize, usize),
    pub marker_lambda: f64,
    pub seed: u64,
}

impl Default for SyntheticCounts {
    fn default() -> Self {
        Self {
            n_cells: 200,
            n_genes: 600,
            n_cell_types: 3,
            genes_per_cell: (80, 160),
            marker_lambda: 20.0,
            seed: 42,
        }
    }
}

/// Generate gene names with a few QC-relevant gene families up front
///
/// Order: `MT-CO1`, `MT-ND1`, `RPS3`, `RPL7`, `HBB`, `HBA1`, `HBP1`, then
/// `GENE{i}` for the rest.
///
/// ### Params
///
/// * `n_genes` - Total number of names to produce.
pub fn synthetic_gene_names(n_genes: usize) -> Vec<String> {
    let special = ["MT-CO1", "MT-ND1", "RPS3", "RPL7", "HBB", "HBA1", "HBP1"];
    (0..n_genes)
        .map(|i| match special.get(i) {
            Some(name) => name.to_string(),
            None => format!("GENE{}", i),
        })
        .collect()
}

/// Create an AnnData with cell-type structured raw counts
///
/// Background genes are drawn from an inverse-rank weighted distribution so
/// that a handful of genes are expressed in most cells and the tail is sparse.
/// Every cell type expresses its own marker block with Poisson counts.
///
/// ### Params
///
/// * `params` - The `SyntheticCounts` parameters.
///
/// ### Returns
///
/// A tuple of `(AnnData, cell type label per cell)`.
///
/// ### Panics
///
/// If `n_genes` is zero or `marker_lambda` is not a positive finite number.
pub fn create_synthetic_adata(
    params: &SyntheticCounts,
) -> Result<(AnnData, Vec<usize>), ProcessingError> {
    let n_genes = params.n_genes;
    let n_types = params.n_cell_types.max(1);
    let block = (n_genes / (4 * n_types)).max(1);

    let weights: Vec<f64> = (1..=n_genes).map(|i| 1.0 / i as f64).collect();
    let alias = WeightedAliasIndex::new(weights).expect("n_genes must be positive");
    let marker_dist =
        Poisson::new(params.marker_lambda).expect("marker_lambda must be positive and finite");

    let mut indptr = Vec::with_capacity(params.n_cells + 1);
    let mut indices = Vec::new();
    let mut data: Vec<f32> = Vec::new();
    let mut labels = Vec::with_capacity(params.n_cells);
    let mut temp_vec: Vec<(usize, f32)> = Vec::with_capacity(n_genes);
    indptr.push(0);

    for cell_idx in 0..params.n_cells {
        let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(cell_idx as u64));
        let cell_type = cell_idx % n_types;
        labels.push(cell_type);
        temp_vec.clear();

        // marker block sits after the named genes
        let marker_start = (7 + cell_type * block).min(n_genes.saturating_sub(block));
        for gene_idx in marker_start..(marker_start + block).min(n_genes) {
            let count: f64 = marker_dist.sample(&mut rng);
            if count > 0.0 {
                temp_vec.push((gene_idx, count as f32));
            }
        }

        let n_background = rng.random_range(params.genes_per_cell.0..=params.genes_per_cell.1);
        for _ in 0..n_background {
            let gene_idx = alias.sample(&mut rng);
            let count = rng.random_range(1..=5) as f32;
            temp_vec.push((gene_idx, count));
        }

        // sort and sum duplicated genes
        temp_vec.sort_unstable_by_key(|(gene_idx, _)| *gene_idx);
        let mut i = 0;
        while i < temp_vec.len() {
            let gene_idx = temp_vec[i].0;
            let mut total_count = temp_vec[i].1;
            let mut j = i + 1;
            while j < temp_vec.len() && temp_vec[j].0 == gene_idx {
                total_count += temp_vec[j].1;
                j += 1;
            }
            indices.push(gene_idx);
            data.push(total_count);
            i = j;
        }
        indptr.push(indices.len());
    }

    let x = CompressedSparseData::new_csr(&data, &indices, &indptr, (params.n_cells, n_genes));
    let obs_names = (0..params.n_cells).map(|i| format!("cell_{}", i)).collect();
    let adata = AnnData::new(x, obs_names, synthetic_gene_names(n_genes))?;

    Ok((adata, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::anndata::AnnotatedData;

    #[test]
    fn test_synthetic_shape_and_determinism() {
        let params = SyntheticCounts {
            n_cells: 30,
            n_genes: 100,
            ..Default::default()
        };
        let (a, labels) = create_synthetic_adata(&params).unwrap();
        let (b, _) = create_synthetic_adata(&params).unwrap();

        assert_eq!(a.n_obs(), 30);
        assert_eq!(a.n_vars(), 100);
        assert_eq!(labels.len(), 30);
        assert_eq!(a.x().data, b.x().data);
        assert_eq!(a.var_names()[0], "MT-CO1");
        assert!(a.x().major_nnz().iter().all(|&n| n > 0));
    }
}
