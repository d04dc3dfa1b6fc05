//! Focus Calibration
//!
//! Maps the dimensionless astigmatic error to a Z displacement.
//!
//! # Overview
//!
//! The calibration process:
//! 1. Step the stage through a range of Z positions (optionally up then down)
//! 2. Wait for settle after each move and record where the stage ended up
//! 3. Measure the focus error on a fresh frame at each position
//! 4. Fit `z = slope * error + intercept` in a local Z frame, rejecting outliers
//! 5. Check the slope sign against the expected optical polarity
//!
//! # Modules
//!
//! - [`config`] - Sweep, fit and quality parameters
//! - [`sweep`] - Stage sweep execution
//! - [`fit`] - Linear fit with outlier rejection
//! - [`quality`] - Advisory checks on a finished sweep
//! - [`storage`] - CSV sample tables

pub mod config;
pub mod fit;
pub mod quality;
pub mod storage;
pub mod sweep;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use config::{FitConfig, OutlierPolicy, QualityThresholds, SweepConfig};
pub use fit::fit;
pub use quality::{quality_issues, QualityIssue};
pub use storage::{load_samples_csv, read_samples, save_samples_csv, write_samples};
pub use sweep::{sweep, sweep_with_progress, StepFailure, StepFailureKind, SweepProgress, SweepReport};
pub use types::{CalibrationReport, CalibrationSample, FocusCalibration};

/// Errors raised by calibration
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Too few usable points to fit a line
    #[error(
        "insufficient calibration data: {valid} valid of {requested} requested points, need {required}"
    )]
    InsufficientCalibrationData {
        valid: usize,
        requested: usize,
        required: usize,
    },

    /// Slope zero or undefined
    #[error("degenerate fit: {0}")]
    DegenerateFit(String),

    /// Slope sign disagrees with the expected optical polarity
    #[error(
        "calibration slope sign mismatch: expected {} slope, got {error_to_um:+.4} um per unit error",
        slope_name(.expected_positive)
    )]
    SignMismatch {
        expected_positive: bool,
        error_to_um: f64,
    },

    /// Configuration validation failure
    #[error("invalid calibration configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

fn slope_name(positive: &bool) -> &'static str {
    if *positive {
        "positive"
    } else {
        "negative"
    }
}

/// Check the slope sign of `calibration` against the expected polarity
///
/// # Errors
/// [`CalibrationError::SignMismatch`] if the signs differ.
pub fn validate_sign(
    calibration: &FocusCalibration,
    expected_positive_slope: bool,
) -> Result<(), CalibrationError> {
    if calibration.is_positive_slope() == expected_positive_slope {
        Ok(())
    } else {
        Err(CalibrationError::SignMismatch {
            expected_positive: expected_positive_slope,
            error_to_um: calibration.error_to_um(),
        })
    }
}

/// Cooperative cancellation flag for sweeps
///
/// Clones share the flag. Cancellation is observed between sweep steps,
/// never in the middle of a move.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
