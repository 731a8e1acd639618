use faer::MatRef;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/////////
// KNN //
/////////

/// Helper struct for KNN with heap
///
/// ### Fields
///
/// * `index` - Index position of that neighbour
/// * `distance` - Squared Euclidean distance to that neighbour
#[derive(Debug)]
struct DistanceItem {
    index: usize,
    distance: f32,
}

impl Eq for DistanceItem {}

impl PartialEq for DistanceItem {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.index == other.index
    }
}

/// Max-heap on distance, so the top is the current worst neighbour. Ties are
/// broken on the index to keep results deterministic.
impl Ord for DistanceItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for DistanceItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Squared Euclidean distance between two rows of a matrix
fn squared_distance(mat: MatRef<f32>, i: usize, j: usize) -> f32 {
    let mut sum = 0.0_f32;
    for col in 0..mat.ncols() {
        let diff = *mat.get(i, col) - *mat.get(j, col);
        sum += diff * diff;
    }
    sum
}

/// Exact kNN search on the rows of an embedding
///
/// Brute force, parallelised over the query rows. Suitable for the sizes of
/// a single batch of cells plus its simulated doublets.
///
/// ### Params
///
/// * `mat` - The embedding with samples as rows.
/// * `k` - Number of neighbours to return. Capped at `nrows - 1`.
///
/// ### Returns
///
/// For every row the indices of its `k` nearest neighbours (excluding
/// itself), ordered from closest to farthest.
pub fn generate_knn_exact(mat: MatRef<f32>, k: usize) -> Vec<Vec<usize>> {
    let n = mat.nrows();
    let k = k.min(n.saturating_sub(1));

    (0..n)
        .into_par_iter()
        .map(|i| {
            if k == 0 {
                return Vec::new();
            }
            let mut heap: BinaryHeap<DistanceItem> = BinaryHeap::with_capacity(k + 1);
            for j in 0..n {
                if j == i {
                    continue;
                }
                let distance = squared_distance(mat, i, j);
                if heap.len() < k {
                    heap.push(DistanceItem { index: j, distance });
                } else if let Some(worst) = heap.peek() {
                    let candidate = DistanceItem { index: j, distance };
                    if candidate < *worst {
                        heap.pop();
                        heap.push(candidate);
                    }
                }
            }
            heap.into_sorted_vec().into_iter().map(|item| item.index).collect()
        })
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn create_clustered_data() -> Mat<f32> {
        let mut data = Vec::new();

        // cluster 1 around (0, 0)
        for i in 0..20 {
            data.push(vec![(i as f32 * 0.1) % 1.0, (i as f32 * 0.15) % 1.0]);
        }

        // cluster 2 around (10, 10)
        for i in 0..20 {
            data.push(vec![
                10.0 + (i as f32 * 0.1) % 1.0,
                10.0 + (i as f32 * 0.15) % 1.0,
            ]);
        }

        Mat::from_fn(40, 2, |i, j| data[i][j])
    }

    #[test]
    fn test_no_self_neighbours_and_count() {
        let data = create_clustered_data();
        let knn = generate_knn_exact(data.as_ref(), 5);

        for (i, neighbours) in knn.iter().enumerate() {
            assert_eq!(neighbours.len(), 5);
            assert!(!neighbours.contains(&i), "Node {} found itself", i);
        }
    }

    #[test]
    fn test_cluster_structure() {
        let data = create_clustered_data();
        let knn = generate_knn_exact(data.as_ref(), 10);

        assert!(knn[0].iter().all(|&n| n < 20));
        assert!(knn[25].iter().all(|&n| n >= 20));
    }

    #[test]
    fn test_ordered_by_distance() {
        let data = Mat::from_fn(4, 1, |i, _| [0.0_f32, 1.0, 3.0, 6.0][i]);
        let knn = generate_knn_exact(data.as_ref(), 3);

        assert_eq!(knn[0], vec![1, 2, 3]);
        assert_eq!(knn[3], vec![2, 1, 0]);
    }

    #[test]
    fn test_k_capped() {
        let data = Mat::from_fn(3, 1, |i, _| i as f32);
        let knn = generate_knn_exact(data.as_ref(), 10);

        assert!(knn.iter().all(|n| n.len() == 2));
    }
}
