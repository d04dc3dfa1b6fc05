use serde::{Deserialize, Serialize};
use shared::camera_interface::Frame;
use shared::image_proc::Roi;
use std::fmt;

/// Focus lock states
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FocusState {
    /// No control; the stage is never commanded
    Idle,
    /// Closed loop on the active ROI
    Locked { frames_processed: usize },
    /// Locked but holding position until the signal returns
    Frozen {
        reason: FreezeReason,
        frames_frozen: usize,
    },
}

impl FocusState {
    /// Locked or frozen
    pub fn is_active(&self) -> bool {
        !matches!(self, FocusState::Idle)
    }
}

/// Why a lock is frozen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezeReason {
    /// ROI intensity below `min_roi_intensity`
    LowIntensity,
    /// Nothing left after background removal
    LowSignal,
    /// Spot centroid within `edge_margin_px` of the ROI border
    NearEdge,
}

impl fmt::Display for FreezeReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FreezeReason::LowIntensity => write!(f, "ROI intensity below threshold"),
            FreezeReason::LowSignal => write!(f, "no spot above background"),
            FreezeReason::NearEdge => write!(f, "spot centroid near ROI edge"),
        }
    }
}

/// Events that drive the controller
#[derive(Debug, Clone)]
pub enum FocusEvent<'a> {
    /// Lock on this ROI at the current stage position
    Start(Roi),
    /// Release the lock
    Stop,
    /// Move the lock to a new ROI, re-anchoring on the next frame
    SetRoi(Roi),
    /// Run one control step
    ProcessFrame(&'a Frame),
}
