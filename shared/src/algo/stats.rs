//! Small robust-statistics helpers used by calibration and its quality checks

use std::cmp::Ordering;

/// Median of the finite values in `values`
///
/// # Returns
///
/// * `Ok(median)` - The median value
/// * `Err(message)` - If no finite values remain after filtering
pub fn median(values: &[f64]) -> Result<f64, String> {
    let mut finite: Vec<f64> = values.iter().filter(|v| v.is_finite()).copied().collect();

    if finite.is_empty() {
        return Err(format!(
            "Insufficient data points to compute median: {} total values, 0 finite",
            values.len()
        ));
    }

    finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mid = finite.len() / 2;
    let median_value = if finite.len() % 2 == 0 {
        (finite[mid - 1] + finite[mid]) / 2.0
    } else {
        finite[mid]
    };

    Ok(median_value)
}

/// Arithmetic mean and population standard deviation
///
/// Returns `None` for an empty slice.
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// Pearson correlation coefficient between two samples
///
/// Returns correlation in range [-1, 1], or NaN if the slices differ in
/// length, are empty, or either has zero variance.
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.is_empty() {
        return f64::NAN;
    }

    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let (cov, var_x, var_y) = x.iter().zip(y).fold((0.0, 0.0, 0.0), |acc, (&xi, &yi)| {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        (acc.0 + dx * dy, acc.1 + dx * dx, acc.2 + dy * dy)
    });

    if var_x < 1e-15 || var_y < 1e-15 {
        return f64::NAN;
    }

    cov / (var_x.sqrt() * var_y.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]).unwrap(), 2.5);
    }

    #[test]
    fn test_median_skips_non_finite() {
        assert_eq!(median(&[f64::NAN, 5.0, f64::INFINITY, 1.0, 3.0]).unwrap(), 3.0);
        assert!(median(&[f64::NAN]).is_err());
        assert!(median(&[]).is_err());
    }

    #[test]
    fn test_mean_and_std() {
        let (mean, std) = mean_and_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_relative_eq!(mean, 5.0);
        assert_relative_eq!(std, 2.0);
        assert!(mean_and_std(&[]).is_none());
    }

    #[test]
    fn test_pearson() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(pearson_correlation(&x, &[2.0, 4.0, 6.0, 8.0]), 1.0);
        assert_relative_eq!(pearson_correlation(&x, &[8.0, 6.0, 4.0, 2.0]), -1.0);
        assert!(pearson_correlation(&x, &[1.0, 1.0, 1.0, 1.0]).is_nan());
        assert!(pearson_correlation(&x, &[1.0]).is_nan());
    }
}
