//////////////////
// VECTOR STUFF //
//////////////////

/// Get the maximum and minimum value of an array
///
/// ### Params
///
/// * `arr` - The array of values. Must not be empty.
///
/// ### Returns
///
/// Tuple of values with the first being the minimum and the second the maximum
pub fn array_max_min<T: PartialOrd + Copy>(arr: &[T]) -> (T, T) {
    let mut min_val = arr[0];
    let mut max_val = arr[0];
    for number in arr {
        if *number < min_val {
            min_val = *number
        }
        if *number > max_val {
            max_val = *number
        }
    }

    (min_val, max_val)
}

/// Centred moving average over integer counts (integer division)
///
/// ### Params
///
/// * `data` - The counts, e.g. histogram bins.
/// * `window` - Width of the window. Truncated at the edges.
///
/// ### Returns
///
/// The smoothed counts
pub fn moving_average(data: &[usize], window: usize) -> Vec<usize> {
    let half_window = window / 2;
    data.iter()
        .enumerate()
        .map(|(i, _)| {
            let start = i.saturating_sub(half_window);
            let end = (i + half_window + 1).min(data.len());
            let sum: usize = data[start..end].iter().sum();
            sum / (end - start)
        })
        .collect()
}

/// Group positions by their label, keeping the order of first appearance
///
/// ### Params
///
/// * `labels` - One label per position.
///
/// ### Returns
///
/// Vector of `(label, positions)` tuples.
pub fn group_by_label(labels: &[String]) -> Vec<(String, Vec<usize>)> {
    let mut groups: indexmap::IndexMap<&str, Vec<usize>> = indexmap::IndexMap::new();
    for (i, label) in labels.iter().enumerate() {
        groups.entry(label.as_str()).or_default().push(i);
    }
    groups
        .into_iter()
        .map(|(label, idx)| (label.to_string(), idx))
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_max_min() {
        assert_eq!(array_max_min(&[3.0, -1.0, 7.5, 2.0]), (-1.0, 7.5));
        assert_eq!(array_max_min(&[4]), (4, 4));
    }

    #[test]
    fn test_moving_average_edges() {
        let smoothed = moving_average(&[3, 6, 9, 0], 3);
        assert_eq!(smoothed, vec![4, 6, 5, 4]);
    }

    #[test]
    fn test_group_by_label_order() {
        let labels: Vec<String> = ["b", "a", "b", "c", "a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let groups = group_by_label(&labels);

        assert_eq!(
            groups,
            vec![
                ("b".to_string(), vec![0, 2]),
                ("a".to_string(), vec![1, 4]),
                ("c".to_string(), vec![3]),
            ]
        );
    }
}
