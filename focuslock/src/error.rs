use shared::image_proc::RoiError;
use shared::stage_interface::StageError;
use thiserror::Error;

use crate::calibration::CalibrationError;

/// Errors produced by the focus controller and its worker.
///
/// Failures inside a running loop iteration never surface here; they are
/// reported through [`SampleStatus`](crate::SampleStatus) instead.
#[derive(Error, Debug)]
pub enum FocusError {
    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested ROI cannot be used.
    #[error("ROI error: {0}")]
    Roi(#[from] RoiError),

    /// Stage could not be read or commanded outside the loop.
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// Calibration rejected or failed.
    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// The stage is owned by the control loop or a running sweep.
    #[error("stage busy: focus lock is running or a calibration sweep holds the stage")]
    StageBusy,

    /// The control or dispatch thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
