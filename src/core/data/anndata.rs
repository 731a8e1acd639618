use indexmap::IndexMap;
use serde_json::Value;

use crate::core::data::sparse_structures::{
    csc_to_csr, CompressedSparseData, CompressedSparseFormat,
};
use crate::core::errors::ProcessingError;

///////////
// Trait //
///////////

/// The minimal surface the module dispatch needs from an annotated data
/// object: its dimensions, the gene names and a way to attach gene-level
/// annotation columns.
pub trait AnnotatedData {
    /// Number of observations (cells)
    fn n_obs(&self) -> usize;

    /// Number of variables (genes)
    fn n_vars(&self) -> usize;

    /// Names of the variables (genes)
    fn var_names(&self) -> &[String];

    /// Add or replace a column in the variable annotation table
    ///
    /// ### Params
    ///
    /// * `key` - Name of the column.
    /// * `column` - The column. Must have `n_vars()` entries.
    fn set_var_column(&mut self, key: &str, column: Column) -> Result<(), ProcessingError>;
}

/////////////
// Columns //
/////////////

/// A typed annotation column
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
}

impl Column {
    /// Number of entries in the column
    pub fn len(&self) -> usize {
        match self {
            Column::Bool(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Str(v) => v.len(),
        }
    }

    /// Is the column empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select the given rows, in the given order
    pub fn subset(&self, keep: &[usize]) -> Self {
        match self {
            Column::Bool(v) => Column::Bool(keep.iter().map(|&i| v[i]).collect()),
            Column::Int(v) => Column::Int(keep.iter().map(|&i| v[i]).collect()),
            Column::Float(v) => Column::Float(keep.iter().map(|&i| v[i]).collect()),
            Column::Str(v) => Column::Str(keep.iter().map(|&i| v[i].clone()).collect()),
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            Column::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&[i64]> {
        match self {
            Column::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&[f64]> {
        match self {
            Column::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Render every entry as a category label
    ///
    /// Used for grouping, e.g. by a batch column. Floats are formatted with
    /// their shortest representation.
    pub fn labels(&self) -> Vec<String> {
        match self {
            Column::Bool(v) => v.iter().map(|x| x.to_string()).collect(),
            Column::Int(v) => v.iter().map(|x| x.to_string()).collect(),
            Column::Float(v) => v.iter().map(|x| x.to_string()).collect(),
            Column::Str(v) => v.clone(),
        }
    }
}

/// Ordered table of equally long annotation columns
///
/// ### Fields
///
/// * `n_rows` - Number of rows every column has to have.
/// * `columns` - The columns in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Annotations {
    n_rows: usize,
    columns: IndexMap<String, Column>,
}

impl Annotations {
    /// Generate an empty table for `n_rows` rows
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: IndexMap::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Insert or replace a column
    ///
    /// ### Params
    ///
    /// * `key` - Column name.
    /// * `column` - The column. Must have `n_rows` entries.
    pub fn insert(&mut self, key: &str, column: Column) -> Result<(), ProcessingError> {
        if column.len() != self.n_rows {
            return Err(ProcessingError::ShapeMismatch {
                expected: self.n_rows,
                got: column.len(),
            });
        }
        self.columns.insert(key.to_string(), column);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Column> {
        self.columns.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.columns.contains_key(key)
    }

    /// Column names in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    /// Keep only the given rows in every column
    pub fn subset(&mut self, keep: &[usize]) {
        for column in self.columns.values_mut() {
            *column = column.subset(keep);
        }
        self.n_rows = keep.len();
    }
}

/////////////
// AnnData //
/////////////

/// In-memory annotated data matrix
///
/// Cells are rows, genes are columns. The counts are kept in CSR layout so
/// per-cell operations walk contiguous memory.
///
/// ### Fields
///
/// * `x` - The (cells x genes) matrix.
/// * `obs_names` - Cell identifiers.
/// * `var_names` - Gene names.
/// * `obs` - Per-cell annotations.
/// * `var` - Per-gene annotations.
/// * `uns` - Unstructured annotations, e.g. run summaries.
#[derive(Clone, Debug)]
pub struct AnnData {
    x: CompressedSparseData<f32>,
    obs_names: Vec<String>,
    var_names: Vec<String>,
    pub obs: Annotations,
    pub var: Annotations,
    pub uns: IndexMap<String, Value>,
}

impl AnnData {
    /// Generate a new AnnData from a sparse matrix
    ///
    /// CSC input is converted to CSR. The compressed structure is checked
    /// against the shape first.
    ///
    /// ### Params
    ///
    /// * `x` - The (cells x genes) matrix.
    /// * `obs_names` - Cell identifiers, one per row.
    /// * `var_names` - Gene names, one per column.
    pub fn new(
        x: CompressedSparseData<f32>,
        obs_names: Vec<String>,
        var_names: Vec<String>,
    ) -> Result<Self, ProcessingError> {
        x.validate()?;
        let x = match x.cs_type {
            CompressedSparseFormat::Csr => x,
            CompressedSparseFormat::Csc => csc_to_csr(x),
        };
        let (nrow, ncol) = x.shape();
        if obs_names.len() != nrow {
            return Err(ProcessingError::ShapeMismatch {
                expected: nrow,
                got: obs_names.len(),
            });
        }
        if var_names.len() != ncol {
            return Err(ProcessingError::ShapeMismatch {
                expected: ncol,
                got: var_names.len(),
            });
        }

        Ok(Self {
            x,
            obs_names,
            var_names,
            obs: Annotations::new(nrow),
            var: Annotations::new(ncol),
            uns: IndexMap::new(),
        })
    }

    /// Generate a new AnnData from dense rows
    ///
    /// ### Params
    ///
    /// * `rows` - One vector of gene values per cell.
    /// * `obs_names` - Cell identifiers.
    /// * `var_names` - Gene names.
    pub fn from_dense(
        rows: &[Vec<f32>],
        obs_names: Vec<String>,
        var_names: Vec<String>,
    ) -> Result<Self, ProcessingError> {
        let ncol = var_names.len();
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        indptr.push(0);

        for row in rows {
            if row.len() != ncol {
                return Err(ProcessingError::ShapeMismatch {
                    expected: ncol,
                    got: row.len(),
                });
            }
            for (j, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    indices.push(j);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }

        let x = CompressedSparseData::new_csr(&data, &indices, &indptr, (rows.len(), ncol));
        Self::new(x, obs_names, var_names)
    }

    pub fn x(&self) -> &CompressedSparseData<f32> {
        &self.x
    }

    /// Mutable access to the stored values. The sparsity pattern and shape
    /// are managed through `subset_obs()` and `subset_var()`.
    pub fn x_values_mut(&mut self) -> &mut [f32] {
        &mut self.x.data
    }

    pub fn obs_names(&self) -> &[String] {
        &self.obs_names
    }

    /// Get a dense copy of one cell
    pub fn dense_row(&self, i: usize) -> Vec<f32> {
        let mut row = vec![0.0_f32; self.n_vars()];
        let (idx, vals) = self.x.major_slice(i);
        for (&j, &v) in idx.iter().zip(vals.iter()) {
            row[j] = v;
        }
        row
    }

    /// Keep only the given cells, in the given order
    pub fn subset_obs(&mut self, keep: &[usize]) {
        self.x.subset_major(keep);
        self.obs_names = keep.iter().map(|&i| self.obs_names[i].clone()).collect();
        self.obs.subset(keep);
    }

    /// Keep only the given genes (ascending indices)
    pub fn subset_var(&mut self, keep: &[usize]) {
        self.x.subset_minor(keep);
        self.var_names = keep.iter().map(|&i| self.var_names[i].clone()).collect();
        self.var.subset(keep);
    }
}

impl AnnotatedData for AnnData {
    fn n_obs(&self) -> usize {
        self.x.shape().0
    }

    fn n_vars(&self) -> usize {
        self.x.shape().1
    }

    fn var_names(&self) -> &[String] {
        &self.var_names
    }

    fn set_var_column(&mut self, key: &str, column: Column) -> Result<(), ProcessingError> {
        self.var.insert(key, column)
    }
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

    fn small_adata() -> AnnData {
        let rows = vec![
            vec![1.0, 0.0, 2.0],
            vec![0.0, 3.0, 0.0],
            vec![4.0, 0.0, 5.0],
        ];
        AnnData::from_dense(&rows, names("cell_", 3), names("gene_", 3)).unwrap()
    }

    #[test]
    fn test_from_dense_shape() {
        let adata = small_adata();

        assert_eq!(adata.n_obs(), 3);
        assert_eq!(adata.n_vars(), 3);
        assert_eq!(adata.x().get_nnz(), 5);
        assert_eq!(adata.dense_row(2), vec![4.0, 0.0, 5.0]);
    }

    #[test]
    fn test_name_length_mismatch() {
        let rows = vec![vec![1.0, 2.0]];
        let res = AnnData::from_dense(&rows, names("cell_", 2), names("gene_", 2));

        assert_eq!(
            res.unwrap_err(),
            ProcessingError::ShapeMismatch {
                expected: 1,
                got: 2
            }
        );
    }

    #[test]
    fn test_malformed_matrix_rejected() {
        let bad = [
            // index beyond ncol
            CompressedSparseData::new_csr(&[1.0], &[5], &[0, 1], (1, 2)),
            // indptr too short
            CompressedSparseData::new_csr(&[1.0], &[0], &[0], (1, 2)),
            // indptr does not end at nnz
            CompressedSparseData::new_csr(&[1.0, 2.0], &[0, 1], &[0, 1], (1, 2)),
            // decreasing indptr
            CompressedSparseData::new_csr(&[1.0, 2.0], &[0, 1], &[0, 2, 1, 2], (3, 2)),
            // indices and data differ
            CompressedSparseData::new_csr(&[1.0, 2.0], &[0], &[0, 2], (1, 2)),
            // CSC row index beyond nrow
            CompressedSparseData::new_csc(&[1.0], &[3], &[0, 1, 1], (2, 2)),
        ];

        for x in bad {
            let (nrow, ncol) = x.shape();
            let res = AnnData::new(x, names("cell_", nrow), names("gene_", ncol));
            assert!(matches!(res, Err(ProcessingError::InvalidMatrix(_))));
        }
    }

    #[test]
    fn test_valid_csc_accepted() {
        let x = CompressedSparseData::new_csc(&[1.0, 2.0], &[1, 0], &[0, 1, 2], (2, 2));
        let adata = AnnData::new(x, names("cell_", 2), names("gene_", 2)).unwrap();

        assert_eq!(adata.dense_row(0), vec![0.0, 2.0]);
        assert_eq!(adata.dense_row(1), vec![1.0, 0.0]);
    }

    #[test]
    fn test_column_length_checked() {
        let mut adata = small_adata();
        let res = adata.set_var_column("flag", Column::Bool(vec![true]));

        assert!(matches!(res, Err(ProcessingError::ShapeMismatch { .. })));
        assert!(!adata.var.contains("flag"));
    }

    #[test]
    fn test_subset_keeps_annotations_aligned() {
        let mut adata = small_adata();
        adata
            .obs
            .insert("batch", Column::Str(vec!["a".into(), "b".into(), "c".into()]))
            .unwrap();
        adata
            .set_var_column("score", Column::Float(vec![0.1, 0.2, 0.3]))
            .unwrap();

        adata.subset_obs(&[0, 2]);
        adata.subset_var(&[0, 2]);

        assert_eq!(adata.obs_names(), &["cell_0".to_string(), "cell_2".to_string()]);
        assert_eq!(adata.var_names(), &["gene_0".to_string(), "gene_2".to_string()]);
        assert_eq!(
            adata.obs.get("batch"),
            Some(&Column::Str(vec!["a".into(), "c".into()]))
        );
        assert_eq!(adata.var.get("score"), Some(&Column::Float(vec![0.1, 0.3])));
        assert_eq!(adata.dense_row(1), vec![4.0, 5.0]);
    }
}
