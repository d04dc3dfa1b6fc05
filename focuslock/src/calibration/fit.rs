//! Linear error→Z fit with optional outlier rejection
//!
//! Fits `z - z_ref = slope * error + intercept`, where `z_ref` is the
//! (weighted) mean sweep Z. Working in this local frame keeps the slope
//! independent of absolute stage coordinates so it can be reused as a
//! relative-move scale anywhere in the travel.

use nalgebra::{Matrix2, Vector2};
use shared::algo::{mean_and_std, median};

use super::config::{FitConfig, OutlierPolicy};
use super::types::{CalibrationReport, CalibrationSample, FocusCalibration};
use super::CalibrationError;

/// Residual floor for sigma clipping so exact data never clips itself
const MIN_CLIP_THRESHOLD_UM: f64 = 1e-12;

/// Sample prepared for fitting, Z already relative to the fit reference
#[derive(Debug, Clone, Copy)]
struct FitPoint {
    error: f64,
    z: f64,
    weight: f64,
}

#[derive(Debug, Clone, Copy)]
struct Line {
    slope: f64,
    intercept: f64,
}

impl Line {
    fn predict(&self, error: f64) -> f64 {
        self.slope * error + self.intercept
    }
}

/// Fit a [`FocusCalibration`] to sweep samples
///
/// Non-finite samples are excluded and reported as outliers. In robust
/// mode the outlier policy picks an inlier set that is then refit with
/// least squares; R² and RMSE are computed on the inliers only.
///
/// # Errors
/// - [`CalibrationError::InsufficientCalibrationData`] with fewer than two usable samples
/// - [`CalibrationError::DegenerateFit`] when the errors have no spread, the
///   weights carry no mass, or the slope comes out zero or non-finite
/// - [`CalibrationError::InvalidConfig`] for a bad outlier policy
pub fn fit(
    samples: &[CalibrationSample],
    config: &FitConfig,
) -> Result<CalibrationReport, CalibrationError> {
    config.validate()?;

    let usable: Vec<usize> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            s.error.is_finite()
                && s.z_um().is_finite()
                && (!config.weight_by_intensity || s.intensity.is_finite())
        })
        .map(|(i, _)| i)
        .collect();

    if usable.len() < 2 {
        return Err(CalibrationError::InsufficientCalibrationData {
            valid: usable.len(),
            requested: samples.len(),
            required: 2,
        });
    }

    let weight_of = |s: &CalibrationSample| {
        if config.weight_by_intensity {
            s.intensity.max(0.0)
        } else {
            1.0
        }
    };

    let total_weight: f64 = usable.iter().map(|&i| weight_of(&samples[i])).sum();
    if total_weight <= 0.0 {
        return Err(CalibrationError::DegenerateFit(
            "sample weights have no positive mass".to_string(),
        ));
    }
    let z_reference_um = usable
        .iter()
        .map(|&i| weight_of(&samples[i]) * samples[i].z_um())
        .sum::<f64>()
        / total_weight;

    let points: Vec<FitPoint> = usable
        .iter()
        .map(|&i| FitPoint {
            error: samples[i].error,
            z: samples[i].z_um() - z_reference_um,
            weight: weight_of(&samples[i]),
        })
        .collect();

    let all = vec![true; points.len()];
    let mut line = weighted_line(&points, &all)?;
    let mut mask = all;

    if config.robust {
        let candidate = match config.outlier_policy {
            OutlierPolicy::MedianSeed { threshold_um } => {
                let seed = median_seed_line(&points).unwrap_or(line);
                within(&points, &seed, threshold_um)
            }
            OutlierPolicy::SigmaClip {
                k_sigma,
                max_iterations,
            } => sigma_clip(&points, &mask, k_sigma, max_iterations),
        };

        if candidate.iter().filter(|&&k| k).count() >= 2 {
            match weighted_line(&points, &candidate) {
                Ok(refit) => {
                    line = refit;
                    mask = candidate;
                }
                Err(e) => log::warn!("Robust refit rejected, keeping full fit: {e}"),
            }
        }
    }

    let calibration = FocusCalibration::new(-line.intercept / line.slope, line.slope)?;
    let (r_squared, rmse_um) = fit_metrics(&points, &mask, &line);

    let mut inliers = vec![false; samples.len()];
    for (&index, &keep) in usable.iter().zip(&mask) {
        inliers[index] = keep;
    }
    let n_inliers = inliers.iter().filter(|&&k| k).count();

    log::info!(
        "Calibration fit: {:.4} um/error, focus error {:+.4}, R²={:.4}, RMSE={:.4} um, {}/{} inliers",
        calibration.error_to_um(),
        calibration.error_at_focus(),
        r_squared,
        rmse_um,
        n_inliers,
        samples.len()
    );

    Ok(CalibrationReport {
        calibration,
        intercept_um: line.intercept,
        z_reference_um,
        r_squared,
        rmse_um,
        n_samples: samples.len(),
        n_inliers,
        inliers,
        robust: config.robust,
    })
}

/// Weighted least squares of z on error over the masked points
fn weighted_line(points: &[FitPoint], mask: &[bool]) -> Result<Line, CalibrationError> {
    let (mut sw, mut se, mut sz, mut see, mut sez) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (p, _) in points.iter().zip(mask).filter(|(_, &keep)| keep) {
        sw += p.weight;
        se += p.weight * p.error;
        sz += p.weight * p.z;
        see += p.weight * p.error * p.error;
        sez += p.weight * p.error * p.z;
    }

    if sw <= 0.0 {
        return Err(CalibrationError::DegenerateFit(
            "sample weights have no positive mass".to_string(),
        ));
    }

    let mean_e = se / sw;
    let var_e = see / sw - mean_e * mean_e;
    if var_e.is_nan() || var_e <= 1e-15 {
        return Err(CalibrationError::DegenerateFit(
            "error values have no spread".to_string(),
        ));
    }

    // Normal equations: [Σe² Σe; Σe Σ1] [slope; intercept] = [Σez; Σz]
    let normal = Matrix2::new(see, se, se, sw);
    let rhs = Vector2::new(sez, sz);
    let solution = normal.lu().solve(&rhs).ok_or_else(|| {
        CalibrationError::DegenerateFit("singular normal equations".to_string())
    })?;

    let line = Line {
        slope: solution[0],
        intercept: solution[1],
    };
    if !line.slope.is_finite() || line.slope == 0.0 || !line.intercept.is_finite() {
        return Err(CalibrationError::DegenerateFit(format!(
            "slope must be finite and non-zero, got {}",
            line.slope
        )));
    }
    Ok(line)
}

/// Line through the pair of points with the smallest median absolute residual
fn median_seed_line(points: &[FitPoint]) -> Option<Line> {
    let mut best: Option<(f64, Line)> = None;
    let mut residuals = Vec::with_capacity(points.len());

    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            let de = b.error - a.error;
            if de == 0.0 {
                continue;
            }
            let slope = (b.z - a.z) / de;
            if slope == 0.0 || !slope.is_finite() {
                continue;
            }
            let line = Line {
                slope,
                intercept: a.z - slope * a.error,
            };

            residuals.clear();
            residuals.extend(points.iter().map(|p| (p.z - line.predict(p.error)).abs()));
            let Ok(score) = median(&residuals) else {
                continue;
            };

            if best.map_or(true, |(m, _)| score < m) {
                best = Some((score, line));
            }
        }
    }

    best.map(|(_, line)| line)
}

fn within(points: &[FitPoint], line: &Line, threshold_um: f64) -> Vec<bool> {
    points
        .iter()
        .map(|p| (p.z - line.predict(p.error)).abs() <= threshold_um)
        .collect()
}

/// Iterative k-sigma trim-and-refit
///
/// Sigma is the unweighted scatter of the kept residuals about their mean.
fn sigma_clip(points: &[FitPoint], start: &[bool], k_sigma: f64, max_iterations: usize) -> Vec<bool> {
    let mut mask = start.to_vec();

    for _ in 0..max_iterations {
        let Ok(line) = weighted_line(points, &mask) else {
            break;
        };

        let residuals: Vec<f64> = points
            .iter()
            .zip(&mask)
            .filter(|(_, &keep)| keep)
            .map(|(p, _)| p.z - line.predict(p.error))
            .collect();
        let Some((center, sigma)) = mean_and_std(&residuals) else {
            break;
        };
        let threshold = (k_sigma * sigma).max(MIN_CLIP_THRESHOLD_UM);

        let next: Vec<bool> = points
            .iter()
            .map(|p| (p.z - line.predict(p.error) - center).abs() <= threshold)
            .collect();
        if next.iter().filter(|&&k| k).count() < 2 || next == mask {
            break;
        }
        mask = next;
    }

    mask
}

/// Weighted R² and RMSE over the masked points
fn fit_metrics(points: &[FitPoint], mask: &[bool], line: &Line) -> (f64, f64) {
    let kept: Vec<&FitPoint> = points
        .iter()
        .zip(mask)
        .filter(|(_, &keep)| keep)
        .map(|(p, _)| p)
        .collect();

    let sw: f64 = kept.iter().map(|p| p.weight).sum();
    let z_mean = kept.iter().map(|p| p.weight * p.z).sum::<f64>() / sw;

    let (ss_res, ss_tot) = kept.iter().fold((0.0, 0.0), |(res, tot), p| {
        let r = p.z - line.predict(p.error);
        (res + p.weight * r * r, tot + p.weight * (p.z - z_mean).powi(2))
    });

    let r_squared = if ss_tot == 0.0 {
        1.0
    } else {
        1.0 - ss_res / ss_tot
    };
    (r_squared, (ss_res / sw).sqrt())
}
