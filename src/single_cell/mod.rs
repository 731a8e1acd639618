//! The native single cell preprocessing methods. They work on `AnnData`
//! and depend on the sparse structures, PCA and kNN search from `core`.

pub mod processing;
pub mod scrublet;
