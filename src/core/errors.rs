use thiserror::Error;

/// Errors raised by the preprocessing routines operating on an annotated
/// data object.
#[derive(Debug, Error, PartialEq)]
pub enum ProcessingError {
    #[error("shape mismatch: expected {expected} entries, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("invalid sparse matrix: {0}")]
    InvalidMatrix(String),

    #[error("column `{0}` not found in obs")]
    MissingObsColumn(String),

    #[error("column `{0}` not found in var")]
    MissingVarColumn(String),

    #[error("var column `{0}` is not boolean")]
    NotBoolean(String),

    #[error("positions outside range of features: {n} is not in 1..={n_vars}")]
    PercentTopOutOfRange { n: i64, n_vars: usize },

    #[error("target_sum must be positive, got {0}")]
    NonPositiveTargetSum(f64),

    #[error("batch `{batch}` has {n_cells} cell(s), at least {min} are needed")]
    InsufficientCells {
        batch: String,
        n_cells: usize,
        min: usize,
    },

    #[error("no variable genes found in batch `{0}`")]
    NoVariableGenes(String),

    #[error("singular value decomposition failed: {0}")]
    Decomposition(String),
}
