use serde::Serialize;
use shared::camera_interface::Timestamp;
use shared::image_proc::Roi;
use std::sync::Arc;

use crate::state::{FocusState, FreezeReason};

/// What a control step did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SampleStatus {
    /// Not locked; the stage was not commanded
    Idle,
    /// A stage command was sent
    Applied,
    /// Correction below the deadband; nothing sent
    Deadband,
    /// Lock frozen; nothing sent, integral held
    Frozen(FreezeReason),
    /// Frame number already processed
    SkippedDuplicate,
    /// The frame could not be measured
    Fault(String),
    /// The stage rejected the command
    CommandFailed(String),
}

impl SampleStatus {
    /// A stage command was accepted during this step
    pub fn applied(&self) -> bool {
        matches!(self, SampleStatus::Applied)
    }
}

/// Telemetry record emitted for every control step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectedSample {
    pub frame_number: u64,
    /// Capture time of the frame
    #[serde(skip)]
    pub timestamp: Timestamp,
    /// Controller state after the step
    pub state: FocusState,
    pub status: SampleStatus,
    /// ROI the frame was measured on, if locked
    pub roi: Option<Roi>,
    /// Dimensionless astigmatic error
    pub error: f64,
    /// Raw ROI intensity
    pub intensity: f64,
    pub low_signal: bool,
    /// Calibrated displacement from the setpoint (µm)
    pub z_offset_um: f64,
    /// Setpoint error fed to the PI law, after filtering (µm)
    pub error_um: f64,
    /// Relative move computed by the PI law after the slew limit (µm)
    pub command_delta_um: f64,
    /// The PI output was cut to `max_step_um`
    pub slew_limited: bool,
    /// Stage position used as the base of the command (µm)
    pub stage_z_um: Option<f64>,
    /// Absolute target sent, or that would have been sent (µm)
    pub commanded_z_um: Option<f64>,
    /// Target was limited by the stage travel or the excursion window
    pub clamped: bool,
    /// PI integral after the step
    pub integral_um: f64,
}

impl CorrectedSample {
    pub(crate) fn new(frame_number: u64, timestamp: Timestamp, state: FocusState) -> Self {
        Self {
            frame_number,
            timestamp,
            state,
            status: SampleStatus::Idle,
            roi: None,
            error: 0.0,
            intensity: 0.0,
            low_signal: false,
            z_offset_um: 0.0,
            error_um: 0.0,
            command_delta_um: 0.0,
            slew_limited: false,
            stage_z_um: None,
            commanded_z_um: None,
            clamped: false,
            integral_um: 0.0,
        }
    }
}

/// Callback ID for registration/deregistration
pub type CallbackId = u64;

/// Observer function type
pub type SampleCallback = Arc<dyn Fn(&CorrectedSample) + Send + Sync>;
