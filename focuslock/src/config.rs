use serde::{Deserialize, Serialize};
use shared::image_proc::ExtractorOptions;
use std::path::Path;
use std::time::Duration;

use crate::controllers::PiGains;
use crate::error::FocusError;

/// Configuration for the closed focus loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Control rate (Hz); also the integration step
    pub loop_hz: f64,
    /// Proportional gain (µm command per µm of error)
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Largest relative move per step (µm)
    pub max_step_um: f64,
    /// Integral accumulator bound (µm·s)
    pub integral_limit_um: f64,
    /// Commands smaller than this are not sent (µm)
    pub command_deadband_um: f64,
    /// Safety window around the lock position (µm); negative disables
    pub af_max_excursion_um: f64,
    /// Absolute stage travel floor (µm)
    pub stage_min_um: Option<f64>,
    /// Absolute stage travel ceiling (µm)
    pub stage_max_um: Option<f64>,
    /// Freeze when raw ROI intensity falls below this
    pub min_roi_intensity: f64,
    /// EMA weight of the previous filtered error, in `[0, 1)`; 0 disables
    pub error_alpha: f64,
    /// Freeze when the spot centroid is this close to the ROI border (px); 0 disables
    pub edge_margin_px: f64,
    /// Error extractor settings
    pub extractor: ExtractorOptions,
    /// Reject calibrations whose slope sign differs from this
    pub expected_positive_slope: Option<bool>,
    /// Capture the current error as the setpoint when locking starts, not only on ROI changes
    pub anchor_on_start: bool,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            loop_hz: 30.0,
            kp: 0.6,
            ki: 0.15,
            max_step_um: 0.25,
            integral_limit_um: 2.0,
            command_deadband_um: 0.005,
            af_max_excursion_um: 5.0,
            stage_min_um: None,
            stage_max_um: None,
            min_roi_intensity: 0.0,
            error_alpha: 0.0,
            edge_margin_px: 0.0,
            extractor: ExtractorOptions::default(),
            expected_positive_slope: None,
            anchor_on_start: false,
        }
    }
}

impl FocusConfig {
    /// Check ranges and cross-field consistency
    pub fn validate(&self) -> Result<(), FocusError> {
        if !self.loop_hz.is_finite() || self.loop_hz <= 0.0 {
            return Err(FocusError::InvalidConfig(format!(
                "loop_hz must be positive and finite, got {}",
                self.loop_hz
            )));
        }

        let non_negative = [
            ("kp", self.kp),
            ("ki", self.ki),
            ("max_step_um", self.max_step_um),
            ("integral_limit_um", self.integral_limit_um),
            ("command_deadband_um", self.command_deadband_um),
            ("min_roi_intensity", self.min_roi_intensity),
            ("edge_margin_px", self.edge_margin_px),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(FocusError::InvalidConfig(format!(
                    "{name} must be non-negative and finite, got {value}"
                )));
            }
        }

        if self.af_max_excursion_um.is_nan() {
            return Err(FocusError::InvalidConfig(
                "af_max_excursion_um must not be NaN".to_string(),
            ));
        }

        if self.error_alpha.is_nan() || !(0.0..1.0).contains(&self.error_alpha) {
            return Err(FocusError::InvalidConfig(format!(
                "error_alpha must be in [0, 1), got {}",
                self.error_alpha
            )));
        }

        if let (Some(min), Some(max)) = (self.stage_min_um, self.stage_max_um) {
            if min > max {
                return Err(FocusError::InvalidConfig(format!(
                    "stage_min_um ({min}) exceeds stage_max_um ({max})"
                )));
            }
        }
        for limit in [self.stage_min_um, self.stage_max_um].into_iter().flatten() {
            if !limit.is_finite() {
                return Err(FocusError::InvalidConfig(format!(
                    "stage limits must be finite, got {limit}"
                )));
            }
        }

        Ok(())
    }

    /// Gains for the PI law
    pub fn pi_gains(&self) -> PiGains {
        PiGains {
            kp: self.kp,
            ki: self.ki,
            loop_hz: self.loop_hz,
            max_step_um: self.max_step_um,
            integral_limit_um: self.integral_limit_um,
        }
    }

    /// Whether the excursion window around the lock position is active
    pub fn excursion_enabled(&self) -> bool {
        self.af_max_excursion_um >= 0.0
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), FocusError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON file and validate
    ///
    /// Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, FocusError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Settings for the background worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Longest wait for a frame before the iteration is skipped
    pub frame_timeout: Duration,
    /// Samples buffered for observers before new ones are dropped
    pub observer_queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(200),
            observer_queue_depth: 64,
        }
    }
}
