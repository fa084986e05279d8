use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use ndarray_stats::SummaryStatisticsExt;
use std::collections::BTreeMap;

/// Below this a standard deviation is treated as exactly zero
pub const ZERO_STD_EPSILON: f64 = 1e-12;

/// Population standard deviation (ddof = 0), zero for an empty sample
pub fn population_std(values: ArrayView1<f64>) -> f64 {
    values.central_moment(2).map(|var| var.max(0.0).sqrt()).unwrap_or(0.0)
}

pub fn mean(values: ArrayView1<f64>) -> f64 {
    values.mean().unwrap_or(0.0)
}

/// Population standard deviation of every column
pub fn column_std(matrix: ArrayView2<f64>) -> Array1<f64> {
    matrix.map_axis(Axis(0), population_std)
}

/// Scale a daily standard deviation by the observed number of trading days.
///
/// Uses the sample's own length, not a fixed 252-day year.
pub fn annualize(daily_std: f64, trading_days: usize) -> f64 {
    daily_std * (trading_days as f64).sqrt()
}

/// Most frequent value; ties go to the largest value
pub fn mode<T, I>(items: I) -> Option<T>
where
    T: Ord + Clone,
    I: IntoIterator<Item = T>,
{
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    // max_by_key keeps the last maximum, i.e. the largest key among ties
    counts.into_iter().max_by_key(|(_, count)| *count).map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn std_matches_numpy_convention() {
        let values = array![1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(population_std(values.view()), 1.118_033_988_749_895, epsilon = 1e-12);
        assert_eq!(population_std(array![5.0, 5.0, 5.0].view()), 0.0);
        assert_eq!(population_std(Array1::<f64>::zeros(0).view()), 0.0);
    }

    #[test]
    fn annualize_uses_observed_days() {
        assert_abs_diff_eq!(annualize(1.0, 250), 250f64.sqrt());
        assert_abs_diff_eq!(annualize(0.5, 4), 1.0);
    }

    #[test]
    fn mode_prefers_larger_value_on_ties() {
        assert_eq!(mode(vec![3, 3, 5, 5, 1]), Some(5));
        assert_eq!(mode(vec![2, 2, 2, 7]), Some(2));
        assert_eq!(mode(Vec::<u32>::new()), None);
    }

    #[test]
    fn column_std_per_asset() {
        let m = array![[1.0, 0.0], [3.0, 0.0]];
        let s = column_std(m.view());
        assert_abs_diff_eq!(s[0], 1.0);
        assert_abs_diff_eq!(s[1], 0.0);
    }
}
