//! Data carried between sweep, fit and controller

use serde::{Deserialize, Serialize};

use super::CalibrationError;

/// One point of a calibration sweep
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// Z the stage was told to go to
    pub commanded_z_um: f64,
    /// Z the stage reported after settling, when it has independent readback
    pub measured_z_um: Option<f64>,
    /// Astigmatic error at this position
    pub error: f64,
    /// Raw ROI intensity at this position
    pub intensity: f64,
}

impl CalibrationSample {
    /// Best known Z: the readback if present, else the commanded value
    pub fn z_um(&self) -> f64 {
        self.measured_z_um.unwrap_or(self.commanded_z_um)
    }
}

/// Linear model mapping focus error to Z displacement
///
/// `z_offset_um = error_to_um * (error - error_at_focus)`
///
/// The slope is never zero or non-finite; [`FocusCalibration::new`] rejects
/// such values. Replace a calibration by swapping in a new value rather than
/// mutating one in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FocusCalibration {
    error_at_focus: f64,
    error_to_um: f64,
}

impl FocusCalibration {
    /// # Errors
    /// [`CalibrationError::DegenerateFit`] for a zero or non-finite slope, or
    /// a non-finite focus error.
    pub fn new(error_at_focus: f64, error_to_um: f64) -> Result<Self, CalibrationError> {
        if !error_to_um.is_finite() || error_to_um == 0.0 {
            return Err(CalibrationError::DegenerateFit(format!(
                "slope must be finite and non-zero, got {error_to_um}"
            )));
        }
        if !error_at_focus.is_finite() {
            return Err(CalibrationError::DegenerateFit(format!(
                "error at focus must be finite, got {error_at_focus}"
            )));
        }
        Ok(Self {
            error_at_focus,
            error_to_um,
        })
    }

    /// Error value at zero displacement
    pub fn error_at_focus(&self) -> f64 {
        self.error_at_focus
    }

    /// Micrometres of Z per unit of error
    pub fn error_to_um(&self) -> f64 {
        self.error_to_um
    }

    /// Z displacement implied by `error`
    pub fn z_offset_um(&self, error: f64) -> f64 {
        self.error_to_um * (error - self.error_at_focus)
    }

    /// Same slope with `error_at_focus = 0`
    ///
    /// Stored fits are reused at runtime purely as scale and sign; the focus
    /// point is re-established per target instead of trusted from disk.
    pub fn for_runtime(&self) -> Self {
        Self {
            error_at_focus: 0.0,
            error_to_um: self.error_to_um,
        }
    }

    pub fn is_positive_slope(&self) -> bool {
        self.error_to_um > 0.0
    }
}

/// Outcome of [`fit`](super::fit)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    /// Fitted model, with `error_at_focus` relative to `z_reference_um`
    pub calibration: FocusCalibration,
    /// Fitted Z at zero error, relative to `z_reference_um`
    pub intercept_um: f64,
    /// Local Z origin of the fit (mean sweep Z)
    pub z_reference_um: f64,
    /// Coefficient of determination on the inlier set
    pub r_squared: f64,
    /// Root-mean-square Z residual on the inlier set
    pub rmse_um: f64,
    pub n_samples: usize,
    pub n_inliers: usize,
    /// Per-sample inlier flags, in input order
    pub inliers: Vec<bool>,
    /// Outlier rejection was requested
    pub robust: bool,
}
