//! Thread-safe control surface of a focus lock
//!
//! A [`FocusHandle`] can be cloned freely and used from any thread while the
//! control loop owns the controller. Run and ROI requests are queued and take
//! effect at the start of the next control step; calibration swaps are
//! visible to the very next step.

use shared::image_proc::{Roi, RoiError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::calibration::{validate_sign, FocusCalibration};
use crate::error::FocusError;
use crate::state::FocusState;

/// Start or stop request waiting for the next step
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RunRequest {
    Start(Roi),
    Stop,
}

/// Requests collected since the last step
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    pub run: Option<RunRequest>,
    pub roi: Option<Roi>,
}

#[derive(Debug)]
struct HandleInner {
    pending: Mutex<PendingRequests>,
    calibration: RwLock<Arc<FocusCalibration>>,
    state: Mutex<FocusState>,
    expected_positive_slope: Option<bool>,
}

/// Cloneable handle for starting, stopping and retargeting a lock
#[derive(Debug, Clone)]
pub struct FocusHandle {
    inner: Arc<HandleInner>,
}

impl FocusHandle {
    /// `calibration` must already be in runtime form
    pub(crate) fn new(calibration: FocusCalibration, expected_positive_slope: Option<bool>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pending: Mutex::new(PendingRequests::default()),
                calibration: RwLock::new(Arc::new(calibration)),
                state: Mutex::new(FocusState::Idle),
                expected_positive_slope,
            }),
        }
    }

    /// Request a lock on `roi`
    ///
    /// Replaces any start or stop request not yet picked up.
    pub fn start(&self, roi: Roi) -> Result<(), FocusError> {
        check_roi(&roi)?;
        self.pending().run = Some(RunRequest::Start(roi));
        Ok(())
    }

    /// Request the lock to be released
    pub fn stop(&self) {
        let mut pending = self.pending();
        pending.run = Some(RunRequest::Stop);
        pending.roi = None;
    }

    /// Move the lock to `roi`; the setpoint is re-anchored on the next frame
    pub fn set_roi(&self, roi: Roi) -> Result<(), FocusError> {
        check_roi(&roi)?;
        self.pending().roi = Some(roi);
        Ok(())
    }

    /// Validate and install a calibration
    ///
    /// The sign is checked against the configured polarity, if any, and the
    /// calibration is normalised with [`FocusCalibration::for_runtime`]
    /// before it replaces the current one.
    pub fn apply_calibration(&self, calibration: &FocusCalibration) -> Result<(), FocusError> {
        if let Some(expected) = self.inner.expected_positive_slope {
            validate_sign(calibration, expected)?;
        }
        let runtime = Arc::new(calibration.for_runtime());
        let mut slot = self
            .inner
            .calibration
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = runtime;
        log::info!(
            "Applied focus calibration: {:+.4} um per unit error",
            calibration.error_to_um()
        );
        Ok(())
    }

    /// Calibration currently in use
    pub fn calibration(&self) -> Arc<FocusCalibration> {
        self.inner
            .calibration
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// State as of the last control step or transition
    pub fn state(&self) -> FocusState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn take_pending(&self) -> PendingRequests {
        std::mem::take(&mut *self.pending())
    }

    pub(crate) fn publish_state(&self, state: FocusState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn check_roi(roi: &Roi) -> Result<(), FocusError> {
    if roi.width == 0 || roi.height == 0 {
        return Err(RoiError::Empty {
            width: roi.width,
            height: roi.height,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationError;

    fn handle(expected: Option<bool>) -> FocusHandle {
        FocusHandle::new(FocusCalibration::new(0.0, 2.0).unwrap(), expected)
    }

    #[test]
    fn test_requests_are_taken_once() {
        let handle = handle(None);
        let roi = Roi::new(0, 0, 8, 8);
        handle.start(roi).unwrap();
        handle.set_roi(Roi::new(4, 4, 8, 8)).unwrap();

        let pending = handle.take_pending();
        assert_eq!(pending.run, Some(RunRequest::Start(roi)));
        assert_eq!(pending.roi, Some(Roi::new(4, 4, 8, 8)));

        let again = handle.take_pending();
        assert!(again.run.is_none() && again.roi.is_none());
    }

    #[test]
    fn test_stop_supersedes_start_and_roi() {
        let handle = handle(None);
        handle.start(Roi::new(0, 0, 8, 8)).unwrap();
        handle.set_roi(Roi::new(1, 1, 8, 8)).unwrap();
        handle.stop();

        let pending = handle.take_pending();
        assert_eq!(pending.run, Some(RunRequest::Stop));
        assert!(pending.roi.is_none());
    }

    #[test]
    fn test_empty_roi_rejected() {
        let handle = handle(None);
        assert!(matches!(
            handle.start(Roi::new(0, 0, 0, 8)),
            Err(FocusError::Roi(RoiError::Empty { .. }))
        ));
        assert!(handle.set_roi(Roi::new(0, 0, 8, 0)).is_err());
    }

    #[test]
    fn test_calibration_swap_is_normalised() {
        let handle = handle(None);
        let other = handle.clone();
        handle
            .apply_calibration(&FocusCalibration::new(0.3, -5.0).unwrap())
            .unwrap();

        let installed = other.calibration();
        assert_eq!(installed.error_to_um(), -5.0);
        assert_eq!(installed.error_at_focus(), 0.0);
    }

    #[test]
    fn test_calibration_sign_enforced() {
        let handle = handle(Some(true));
        let err = handle
            .apply_calibration(&FocusCalibration::new(0.0, -5.0).unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            FocusError::Calibration(CalibrationError::SignMismatch { .. })
        ));
        // Previous calibration kept
        assert_eq!(handle.calibration().error_to_um(), 2.0);
    }
}
