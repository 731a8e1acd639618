use std::ops::AddAssign;

use crate::core::errors::ProcessingError;

////////////////
// Structures //
////////////////

/// Type to describe the CompressedSparseFormat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedSparseFormat {
    /// CSC-formatted data
    Csc,
    /// CSR-formatted data
    Csr,
}

/// Compressed sparse matrix in either CSR or CSC layout
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `indices` - Column indices (CSR) or row indices (CSC) of the values.
/// * `indptr` - Row pointers (CSR) or column pointers (CSC).
/// * `cs_type` - Which layout the data is stored in.
/// * `shape` - `(nrow, ncol)` of the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSparseData<T>
where
    T: Clone + Default,
{
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub cs_type: CompressedSparseFormat,
    pub shape: (usize, usize),
}

impl<T> CompressedSparseData<T>
where
    T: Clone + Default,
{
    /// Generate a new CSC version of the matrix
    ///
    /// ### Params
    ///
    /// * `data` - The underlying data
    /// * `indices` - The index positions (in this case row indices)
    /// * `indptr` - The index pointer (in this case the column index pointers)
    /// * `shape` - `(nrow, ncol)` of the matrix
    pub fn new_csc(data: &[T], indices: &[usize], indptr: &[usize], shape: (usize, usize)) -> Self {
        Self {
            data: data.to_vec(),
            indices: indices.to_vec(),
            indptr: indptr.to_vec(),
            cs_type: CompressedSparseFormat::Csc,
            shape,
        }
    }

    /// Generate a new CSR version of the matrix
    ///
    /// ### Params
    ///
    /// * `data` - The underlying data
    /// * `indices` - The index positions (in this case column indices)
    /// * `indptr` - The index pointer (in this case the row index pointers)
    /// * `shape` - `(nrow, ncol)` of the matrix
    pub fn new_csr(data: &[T], indices: &[usize], indptr: &[usize], shape: (usize, usize)) -> Self {
        Self {
            data: data.to_vec(),
            indices: indices.to_vec(),
            indptr: indptr.to_vec(),
            cs_type: CompressedSparseFormat::Csr,
            shape,
        }
    }

    /// Transform from CSC to CSR or vice versa
    ///
    /// ### Returns
    ///
    /// The transformed/transposed version
    pub fn transform(self) -> Self {
        match self.cs_type {
            CompressedSparseFormat::Csc => csc_to_csr(self),
            CompressedSparseFormat::Csr => csr_to_csc(self),
        }
    }

    /// Returns the shape of the matrix
    ///
    /// ### Returns
    ///
    /// A tuple of `(nrow, ncol)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Returns the NNZ
    pub fn get_nnz(&self) -> usize {
        self.data.len()
    }

    /// Number of major-axis slices (rows for CSR, columns for CSC)
    pub fn n_major(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    /// Indices and values of one major-axis slice
    ///
    /// ### Params
    ///
    /// * `i` - Row (CSR) or column (CSC) index.
    ///
    /// ### Returns
    ///
    /// Tuple of `(minor indices, values)`.
    pub fn major_slice(&self, i: usize) -> (&[usize], &[T]) {
        let start = self.indptr[i];
        let end = self.indptr[i + 1];
        (&self.indices[start..end], &self.data[start..end])
    }

    /// Check the compressed structure against the shape
    ///
    /// `indptr` needs one entry per major slice plus one, start at zero,
    /// never decrease and end at the number of values. `indices` must match
    /// `data` in length and stay below the minor dimension.
    pub fn validate(&self) -> Result<(), ProcessingError> {
        let (n_major, n_minor) = match self.cs_type {
            CompressedSparseFormat::Csr => (self.shape.0, self.shape.1),
            CompressedSparseFormat::Csc => (self.shape.1, self.shape.0),
        };

        if self.indptr.len() != n_major + 1 {
            return Err(ProcessingError::InvalidMatrix(format!(
                "indptr has {} entries, expected {}",
                self.indptr.len(),
                n_major + 1
            )));
        }
        if self.indices.len() != self.data.len() {
            return Err(ProcessingError::InvalidMatrix(format!(
                "{} indices for {} values",
                self.indices.len(),
                self.data.len()
            )));
        }
        if self.indptr[0] != 0 || self.indptr.windows(2).any(|w| w[1] < w[0]) {
            return Err(ProcessingError::InvalidMatrix(
                "indptr must start at 0 and be non-decreasing".to_string(),
            ));
        }
        if self.indptr[n_major] != self.data.len() {
            return Err(ProcessingError::InvalidMatrix(format!(
                "indptr ends at {}, expected {}",
                self.indptr[n_major],
                self.data.len()
            )));
        }
        if let Some(&idx) = self.indices.iter().find(|&&idx| idx >= n_minor) {
            return Err(ProcessingError::InvalidMatrix(format!(
                "index {} out of bounds for dimension {}",
                idx, n_minor
            )));
        }

        Ok(())
    }

    /// Number of stored values per major-axis slice
    pub fn major_nnz(&self) -> Vec<usize> {
        self.indptr.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Number of stored values per minor-axis slice
    pub fn minor_nnz(&self) -> Vec<usize> {
        let n_minor = match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.1,
            CompressedSparseFormat::Csc => self.shape.0,
        };
        let mut counts = vec![0_usize; n_minor];
        for &idx in &self.indices {
            counts[idx] += 1;
        }
        counts
    }

    /// Keep only the selected major-axis slices (rows for CSR)
    ///
    /// ### Params
    ///
    /// * `keep` - Indices of the slices to keep, in output order.
    pub fn subset_major(&mut self, keep: &[usize]) {
        let mut data = Vec::with_capacity(self.data.len());
        let mut indices = Vec::with_capacity(self.indices.len());
        let mut indptr = Vec::with_capacity(keep.len() + 1);
        indptr.push(0);

        for &i in keep {
            let (idx, vals) = self.major_slice(i);
            indices.extend_from_slice(idx);
            data.extend_from_slice(vals);
            indptr.push(indices.len());
        }

        self.data = data;
        self.indices = indices;
        self.indptr = indptr;
        match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.0 = keep.len(),
            CompressedSparseFormat::Csc => self.shape.1 = keep.len(),
        }
    }

    /// Keep only the selected minor-axis positions (columns for CSR)
    ///
    /// Indices are remapped to their position in `keep`. `keep` is expected
    /// to be sorted ascending so the minor indices stay sorted.
    ///
    /// ### Params
    ///
    /// * `keep` - Indices of the positions to keep.
    pub fn subset_minor(&mut self, keep: &[usize]) {
        let n_minor = match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.1,
            CompressedSparseFormat::Csc => self.shape.0,
        };
        let mut remap: Vec<Option<usize>> = vec![None; n_minor];
        for (new_idx, &old_idx) in keep.iter().enumerate() {
            remap[old_idx] = Some(new_idx);
        }

        let mut data = Vec::with_capacity(self.data.len());
        let mut indices = Vec::with_capacity(self.indices.len());
        let mut indptr = Vec::with_capacity(self.indptr.len());
        indptr.push(0);

        for i in 0..self.n_major() {
            for pos in self.indptr[i]..self.indptr[i + 1] {
                if let Some(new_idx) = remap[self.indices[pos]] {
                    indices.push(new_idx);
                    data.push(self.data[pos].clone());
                }
            }
            indptr.push(indices.len());
        }

        self.data = data;
        self.indices = indices;
        self.indptr = indptr;
        match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.1 = keep.len(),
            CompressedSparseFormat::Csc => self.shape.0 = keep.len(),
        }
    }
}

impl<T> CompressedSparseData<T>
where
    T: Clone + Default + Copy + AddAssign,
{
    /// Sum of the values per major-axis slice (row sums for CSR)
    pub fn major_sums(&self) -> Vec<T> {
        (0..self.n_major())
            .map(|i| {
                let mut sum = T::default();
                for &v in self.major_slice(i).1 {
                    sum += v;
                }
                sum
            })
            .collect()
    }

    /// Sum of the values per minor-axis position (column sums for CSR)
    pub fn minor_sums(&self) -> Vec<T> {
        let n_minor = match self.cs_type {
            CompressedSparseFormat::Csr => self.shape.1,
            CompressedSparseFormat::Csc => self.shape.0,
        };
        let mut sums = vec![T::default(); n_minor];
        for (&idx, &v) in self.indices.iter().zip(self.data.iter()) {
            sums[idx] += v;
        }
        sums
    }
}

/// Transforms a CompressedSparseData that is CSC to CSR
///
/// ### Params
///
/// * `sparse_data` - The CompressedSparseData you want to transform
pub fn csc_to_csr<T>(sparse_data: CompressedSparseData<T>) -> CompressedSparseData<T>
where
    T: Clone + Default,
{
    let (nrow, _) = sparse_data.shape();
    let nnz = sparse_data.get_nnz();
    let mut row_ptr = vec![0; nrow + 1];

    for &r in &sparse_data.indices {
        row_ptr[r + 1] += 1;
    }

    for i in 0..nrow {
        row_ptr[i + 1] += row_ptr[i];
    }

    let mut csr_data = vec![T::default(); nnz];
    let mut csr_col_ind = vec![0; nnz];
    let mut next = row_ptr[..nrow].to_vec();

    for col in 0..sparse_data.n_major() {
        for idx in sparse_data.indptr[col]..sparse_data.indptr[col + 1] {
            let row = sparse_data.indices[idx];
            let pos = next[row];

            csr_data[pos] = sparse_data.data[idx].clone();
            csr_col_ind[pos] = col;

            next[row] += 1;
        }
    }

    CompressedSparseData {
        data: csr_data,
        indices: csr_col_ind,
        indptr: row_ptr,
        cs_type: CompressedSparseFormat::Csr,
        shape: sparse_data.shape(),
    }
}

/// Transform CSR stored data into CSC stored data
///
/// This version does a full memory copy of the data.
///
/// ### Params
///
/// * `sparse_data` - The data stored in CSR format.
///
/// ### Returns
///
/// The data in CSC format.
pub fn csr_to_csc<T>(sparse_data: CompressedSparseData<T>) -> CompressedSparseData<T>
where
    T: Clone + Default,
{
    let nnz = sparse_data.get_nnz();
    let (_, ncol) = sparse_data.shape();
    let mut col_ptr = vec![0; ncol + 1];

    // count occurrences per column
    for &c in &sparse_data.indices {
        col_ptr[c + 1] += 1;
    }

    for i in 0..ncol {
        col_ptr[i + 1] += col_ptr[i];
    }

    let mut csc_data = vec![T::default(); nnz];
    let mut csc_row_ind = vec![0; nnz];
    let mut next = col_ptr[..ncol].to_vec();

    for row in 0..sparse_data.n_major() {
        for idx in sparse_data.indptr[row]..sparse_data.indptr[row + 1] {
            let col = sparse_data.indices[idx];
            let pos = next[col];

            csc_data[pos] = sparse_data.data[idx].clone();
            csc_row_ind[pos] = row;

            next[col] += 1;
        }
    }

    CompressedSparseData {
        data: csc_data,
        indices: csc_row_ind,
        indptr: col_ptr,
        cs_type: CompressedSparseFormat::Csc,
        shape: sparse_data.shape(),
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    // [1 0 2]
    // [0 3 0]
    // [4 0 5]
    fn example_csr() -> CompressedSparseData<i32> {
        CompressedSparseData::new_csr(&[1, 2, 3, 4, 5], &[0, 2, 1, 0, 2], &[0, 2, 3, 5], (3, 3))
    }

    #[test]
    fn test_csc_to_csr_conversion() {
        let data = vec![1, 4, 3, 2, 5];
        let row_ind = vec![0, 2, 1, 0, 2];
        let col_ptr = vec![0, 2, 3, 5];

        let csc_matrix = CompressedSparseData::new_csc(&data, &row_ind, &col_ptr, (3, 3));
        let csr_matrix = csc_to_csr(csc_matrix);

        assert_eq!(csr_matrix.data, vec![1, 2, 3, 4, 5]);
        assert_eq!(csr_matrix.indices, vec![0, 2, 1, 0, 2]);
        assert_eq!(csr_matrix.indptr, vec![0, 2, 3, 5]);
        assert_eq!(csr_matrix.shape, (3, 3));
        assert!(matches!(csr_matrix.cs_type, CompressedSparseFormat::Csr));
    }

    #[test]
    fn test_csr_to_csc_conversion() {
        let csc_matrix = csr_to_csc(example_csr());

        assert_eq!(csc_matrix.data, vec![1, 4, 3, 2, 5]);
        assert_eq!(csc_matrix.indices, vec![0, 2, 1, 0, 2]);
        assert_eq!(csc_matrix.indptr, vec![0, 2, 3, 5]);
        assert!(matches!(csc_matrix.cs_type, CompressedSparseFormat::Csc));
    }

    #[test]
    fn test_sums_and_nnz() {
        let csr = example_csr();

        assert_eq!(csr.major_sums(), vec![3, 3, 9]);
        assert_eq!(csr.minor_sums(), vec![5, 3, 7]);
        assert_eq!(csr.major_nnz(), vec![2, 1, 2]);
        assert_eq!(csr.minor_nnz(), vec![2, 1, 2]);
    }

    #[test]
    fn test_subset_rows() {
        let mut csr = example_csr();
        csr.subset_major(&[0, 2]);

        assert_eq!(csr.shape, (2, 3));
        assert_eq!(csr.data, vec![1, 2, 4, 5]);
        assert_eq!(csr.indices, vec![0, 2, 0, 2]);
        assert_eq!(csr.indptr, vec![0, 2, 4]);
    }

    #[test]
    fn test_subset_columns() {
        let mut csr = example_csr();
        csr.subset_minor(&[1, 2]);

        // [0 2]
        // [3 0]
        // [0 5]
        assert_eq!(csr.shape, (3, 2));
        assert_eq!(csr.data, vec![2, 3, 5]);
        assert_eq!(csr.indices, vec![1, 0, 1]);
        assert_eq!(csr.indptr, vec![0, 1, 2, 3]);
    }
}
