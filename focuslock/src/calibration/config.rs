//! Configuration types for calibration sweeps and fits

use serde::{Deserialize, Serialize};
use shared::image_proc::ExtractorOptions;
use std::time::Duration;

use super::CalibrationError;

/// How a Z sweep is driven
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Lowest target, µm
    pub z_min_um: f64,
    /// Highest target, µm
    pub z_max_um: f64,
    /// Evenly spaced targets per pass, endpoints included
    pub n_steps: usize,
    /// Follow the ascending pass with a descending one
    pub bidirectional: bool,
    /// Wait after each accepted move before reading back
    pub settle_time: Duration,
    /// Readback must land within this distance of the target
    pub settle_tolerance_um: f64,
    /// Readback polls before accepting whatever the stage reports
    pub max_settle_polls: usize,
    /// Wait between readback polls
    pub settle_poll_interval: Duration,
    /// Extra attempts after a rejected move
    pub move_retries: usize,
    /// First retry delay; doubles on each further retry
    pub retry_backoff: Duration,
    /// Per-frame acquisition deadline
    pub frame_timeout: Duration,
    /// Stale frames tolerated per step before giving up on it
    pub max_duplicate_frames: usize,
    /// Minimum share of requested points that must succeed
    pub min_success_fraction: f64,
    /// Error extractor settings used on every sweep frame
    pub extractor: ExtractorOptions,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            z_min_um: -2.0,
            z_max_um: 2.0,
            n_steps: 21,
            bidirectional: true,
            settle_time: Duration::from_millis(50),
            settle_tolerance_um: 0.05,
            max_settle_polls: 5,
            settle_poll_interval: Duration::from_millis(10),
            move_retries: 2,
            retry_backoff: Duration::from_millis(20),
            frame_timeout: Duration::from_millis(500),
            max_duplicate_frames: 3,
            min_success_fraction: 0.6,
            extractor: ExtractorOptions::default(),
        }
    }
}

impl SweepConfig {
    /// Symmetric sweep of `±half_range_um` around `center_z_um` in steps of
    /// at least `step_um`; a span that is not a whole number of steps is
    /// covered by fewer, slightly wider steps
    pub fn centered(center_z_um: f64, half_range_um: f64, step_um: f64) -> Self {
        let n_steps = if step_um > 0.0 && half_range_um > 0.0 {
            ((2.0 * half_range_um / step_um + 1e-9).floor() as usize + 1).max(2)
        } else {
            2
        };
        Self {
            z_min_um: center_z_um - half_range_um,
            z_max_um: center_z_um + half_range_um,
            n_steps,
            ..Default::default()
        }
    }

    /// Stage targets in visiting order
    pub fn targets(&self) -> Vec<f64> {
        let span = self.z_max_um - self.z_min_um;
        let denom = self.n_steps.saturating_sub(1).max(1) as f64;
        let forward: Vec<f64> = (0..self.n_steps)
            .map(|i| self.z_min_um + span * i as f64 / denom)
            .collect();

        if self.bidirectional {
            let mut all = forward.clone();
            all.extend(forward.iter().rev());
            all
        } else {
            forward
        }
    }

    /// Valid points a sweep must collect to succeed
    pub fn required_points(&self, requested: usize) -> usize {
        ((self.min_success_fraction * requested as f64).ceil() as usize).max(2)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if !self.z_min_um.is_finite() || !self.z_max_um.is_finite() {
            return Err(CalibrationError::InvalidConfig(
                "sweep limits must be finite".to_string(),
            ));
        }
        if self.z_max_um <= self.z_min_um {
            return Err(CalibrationError::InvalidConfig(format!(
                "z_max_um ({}) must be greater than z_min_um ({})",
                self.z_max_um, self.z_min_um
            )));
        }
        if self.n_steps < 2 {
            return Err(CalibrationError::InvalidConfig(
                "n_steps must be at least 2".to_string(),
            ));
        }
        if self.min_success_fraction.is_nan()
            || self.min_success_fraction <= 0.0
            || self.min_success_fraction > 1.0
        {
            return Err(CalibrationError::InvalidConfig(format!(
                "min_success_fraction must be in (0, 1], got {}",
                self.min_success_fraction
            )));
        }
        if self.settle_tolerance_um.is_nan() || self.settle_tolerance_um < 0.0 {
            return Err(CalibrationError::InvalidConfig(
                "settle_tolerance_um must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outlier rejection strategy for robust fits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OutlierPolicy {
    /// Seed with the pairwise line of least median residual, keep points
    /// within `threshold_um` of it, refit
    MedianSeed { threshold_um: f64 },
    /// Iteratively drop points beyond `k_sigma` residual standard
    /// deviations and refit, at most `max_iterations` times
    SigmaClip { k_sigma: f64, max_iterations: usize },
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        OutlierPolicy::MedianSeed { threshold_um: 0.2 }
    }
}

/// Fit options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Reject outliers before the final fit
    pub robust: bool,
    pub outlier_policy: OutlierPolicy,
    /// Weight each sample by its ROI intensity
    pub weight_by_intensity: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            robust: true,
            outlier_policy: OutlierPolicy::default(),
            weight_by_intensity: false,
        }
    }
}

impl FitConfig {
    /// Plain least squares, no outlier rejection
    pub fn ordinary() -> Self {
        Self {
            robust: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        match self.outlier_policy {
            OutlierPolicy::MedianSeed { threshold_um }
                if threshold_um.is_nan() || threshold_um <= 0.0 =>
            {
                Err(CalibrationError::InvalidConfig(format!(
                    "outlier threshold must be positive, got {threshold_um}"
                )))
            }
            OutlierPolicy::SigmaClip { k_sigma, .. } if k_sigma.is_nan() || k_sigma <= 0.0 => {
                Err(CalibrationError::InvalidConfig(format!(
                    "k_sigma must be positive, got {k_sigma}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Limits for [`quality_issues`](super::quality_issues)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Smallest acceptable |Pearson r| between Z and error
    pub min_abs_correlation: f64,
    /// Smallest acceptable max-min error range over the sweep
    pub min_error_span: f64,
    /// Tolerance, as a fraction of the error span, for a fitted focus
    /// outside the sampled errors
    pub focus_margin_fraction: f64,
    /// Largest acceptable error difference between passes at the same Z
    pub max_bidirectional_hysteresis: f64,
    /// Smallest acceptable R²
    pub min_r_squared: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_abs_correlation: 0.2,
            min_error_span: 0.01,
            focus_margin_fraction: 0.1,
            max_bidirectional_hysteresis: 0.02,
            min_r_squared: 0.9,
        }
    }
}
