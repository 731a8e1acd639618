use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;

use crate::core::errors::ProcessingError;

////////////////
// Structures //
////////////////

/// Structure for PCA results
///
/// ### Fields
///
/// * `scores` - The samples projected on the PC space (samples x PCs).
/// * `loadings` - The feature loadings (features x PCs).
#[derive(Clone, Debug)]
pub struct PcaResults {
    pub scores: Mat<f32>,
    pub loadings: Mat<f32>,
}

///////////////
// Functions //
///////////////

/// Randomised SVD returning the right singular vectors
///
/// ### Params
///
/// * `x` - The matrix to decompose.
/// * `rank` - Number of components to keep.
/// * `seed` - Seed for the random projection.
/// * `oversampling` - Additional random vectors. Defaults to 10.
/// * `n_power_iter` - Power iterations to sharpen the spectrum. Defaults to 2.
///
/// ### Returns
///
/// The right singular vectors `V` with `min(rank + oversampling, ncol, nrow)`
/// columns.
pub fn randomised_svd_v_f32(
    x: MatRef<f32>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> Result<Mat<f32>, ProcessingError> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal =
        Normal::new(0.0, 1.0).map_err(|e| ProcessingError::Decomposition(e.to_string()))?;
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng) as f32);

    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * &q;
        q = (x * z).qr().compute_thin_Q();
    }

    // SVD on the low-rank approximation
    let b = q.transpose() * x;
    let svd = b
        .thin_svd()
        .map_err(|e| ProcessingError::Decomposition(format!("{:?}", e)))?;

    Ok(svd.V().to_owned())
}

/// Run a PCA on already scaled data
///
/// ### Params
///
/// * `scaled` - The centred and scaled data (samples x features).
/// * `no_pcs` - Number of principal components. Capped at
///   `min(nrow, ncol)`.
/// * `random_svd` - Shall randomised SVD be used. Faster, less precise.
/// * `seed` - Seed for the randomised SVD.
///
/// ### Returns
///
/// The `PcaResults` with scores and loadings.
pub fn pca_on_scaled(
    scaled: MatRef<f32>,
    no_pcs: usize,
    random_svd: bool,
    seed: u64,
) -> Result<PcaResults, ProcessingError> {
    let num_features = scaled.ncols();
    let no_pcs = no_pcs.min(scaled.nrows()).min(num_features).max(1);

    let v = if random_svd {
        randomised_svd_v_f32(scaled, no_pcs, seed, Some(100_usize), None)?
    } else {
        scaled
            .thin_svd()
            .map_err(|e| ProcessingError::Decomposition(format!("{:?}", e)))?
            .V()
            .to_owned()
    };

    let no_pcs = no_pcs.min(v.ncols());
    let loadings = v.submatrix(0, 0, num_features, no_pcs).to_owned();
    let scores = scaled * &loadings;

    Ok(PcaResults { scores, loadings })
}
