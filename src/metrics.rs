/// Compute similarity metrics (best, mean, median) over a result set.
pub fn compute_similarity_metrics(values: &[f64]) -> Option<(f64, f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let best = sorted[n - 1];
    let mean = values.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };
    Some((best, mean, median))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_metrics() {
        assert!(compute_similarity_metrics(&[]).is_none());
    }

    #[test]
    fn odd_and_even_counts() {
        let (best, mean, median) = compute_similarity_metrics(&[0.5, 0.9, 0.7]).unwrap();
        assert_eq!(best, 0.9);
        assert!((mean - 0.7).abs() < 1e-9);
        assert_eq!(median, 0.7);

        let (_, _, median) = compute_similarity_metrics(&[0.4, 0.8, 0.6, 1.0]).unwrap();
        assert!((median - 0.7).abs() < 1e-9);
    }
}
