//! Advisory checks on a finished calibration
//!
//! None of these block a fit; they flag sweeps that are likely to lock badly
//! so the operator can re-run with a better range or ROI.

use serde::Serialize;
use shared::algo::pearson_correlation;
use std::collections::BTreeMap;
use std::fmt;

use super::config::QualityThresholds;
use super::types::{CalibrationReport, CalibrationSample};

/// A reason a calibration may be unsafe to lock with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QualityIssue {
    TooFewSamples { n: usize },
    /// The sweep barely changed the error signal
    ErrorSpanTooSmall { span: f64, min: f64 },
    /// Error and Z are only loosely related
    WeakCorrelation { abs_r: f64, min: f64 },
    /// Up and down passes disagree at the same commanded Z
    Hysteresis { max_delta: f64, limit: f64 },
    /// The fitted focus error lies outside what the sweep observed
    FocusOutsideRange {
        error_at_focus: f64,
        min_error: f64,
        max_error: f64,
    },
    LowRSquared { r_squared: f64, min: f64 },
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QualityIssue::TooFewSamples { n } => write!(f, "need at least 2 samples, got {n}"),
            QualityIssue::ErrorSpanTooSmall { span, .. } => write!(
                f,
                "error span too small ({span:.4}); increase Z range or improve ROI SNR"
            ),
            QualityIssue::WeakCorrelation { abs_r, .. } => write!(
                f,
                "error-vs-Z is weakly correlated (|r|={abs_r:.3}); keep ROI centred and reduce sweep range around focus"
            ),
            QualityIssue::Hysteresis { max_delta, .. } => write!(
                f,
                "up/down sweep mismatch is high ({max_delta:.4}); possible backlash or stage settling issue"
            ),
            QualityIssue::FocusOutsideRange {
                error_at_focus,
                min_error,
                max_error,
            } => write!(
                f,
                "fitted focus error {error_at_focus:+.4} lies outside sampled range [{min_error:+.4}, {max_error:+.4}]; sweep likely does not bracket focus"
            ),
            QualityIssue::LowRSquared { r_squared, min } => {
                write!(f, "fit R² {r_squared:.3} below {min:.3}")
            }
        }
    }
}

/// List the quality problems of a sweep and its fit
///
/// An empty list means nothing suspicious was found.
pub fn quality_issues(
    samples: &[CalibrationSample],
    report: &CalibrationReport,
    thresholds: &QualityThresholds,
) -> Vec<QualityIssue> {
    if samples.len() < 2 {
        return vec![QualityIssue::TooFewSamples { n: samples.len() }];
    }

    let mut issues = Vec::new();
    let errors: Vec<f64> = samples.iter().map(|s| s.error).collect();
    let z_values: Vec<f64> = samples.iter().map(|s| s.z_um()).collect();

    let min_error = errors.iter().copied().fold(f64::INFINITY, f64::min);
    let max_error = errors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max_error - min_error;

    if span < thresholds.min_error_span {
        issues.push(QualityIssue::ErrorSpanTooSmall {
            span,
            min: thresholds.min_error_span,
        });
    }

    // NaN (no variance) counts as uncorrelated
    let abs_r = pearson_correlation(&z_values, &errors).abs();
    if abs_r.is_nan() || abs_r < thresholds.min_abs_correlation {
        issues.push(QualityIssue::WeakCorrelation {
            abs_r: if abs_r.is_nan() { 0.0 } else { abs_r },
            min: thresholds.min_abs_correlation,
        });
    }

    // Group by commanded Z in nanometres; bidirectional sweeps revisit each target
    let mut by_target: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    let mut revisited = BTreeMap::new();
    for s in samples {
        let key = (s.commanded_z_um * 1000.0).round() as i64;
        let entry = by_target.entry(key).or_insert((s.error, s.error));
        entry.0 = entry.0.min(s.error);
        entry.1 = entry.1.max(s.error);
        *revisited.entry(key).or_insert(0usize) += 1;
    }
    let max_delta = by_target
        .iter()
        .filter(|(key, _)| revisited.get(*key).copied().unwrap_or(0) > 1)
        .map(|(_, (lo, hi))| hi - lo)
        .fold(0.0, f64::max);
    if max_delta > thresholds.max_bidirectional_hysteresis {
        issues.push(QualityIssue::Hysteresis {
            max_delta,
            limit: thresholds.max_bidirectional_hysteresis,
        });
    }

    // Tolerate a slightly out-of-range centre: astigmatic curves bend near
    // the lobe crossover even when the sweep brackets focus.
    let e0 = report.calibration.error_at_focus();
    let margin = (span * thresholds.focus_margin_fraction).max(0.02);
    let near_tolerance = (span * 0.25).max(0.02);
    let nearest = errors
        .iter()
        .map(|e| (e - e0).abs())
        .fold(f64::INFINITY, f64::min);
    if (e0 < min_error - margin || e0 > max_error + margin) && nearest > near_tolerance {
        issues.push(QualityIssue::FocusOutsideRange {
            error_at_focus: e0,
            min_error,
            max_error,
        });
    }

    if report.r_squared < thresholds.min_r_squared {
        issues.push(QualityIssue::LowRSquared {
            r_squared: report.r_squared,
            min: thresholds.min_r_squared,
        });
    }

    issues
}
