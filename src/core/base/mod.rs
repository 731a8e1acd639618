//! Linear algebra helpers

pub mod pca_svd;
