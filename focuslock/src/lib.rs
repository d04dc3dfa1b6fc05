//! FOCUSLOCK - closed-loop astigmatic focus stabilisation
//!
//! Holds a microscope in focus by turning the shape of an astigmatic spot
//! into a Z error and feeding it back to a Z stage:
//!
//! frame -> [`extract`] -> error -> [`FocusCalibration`] -> Z offset -> PI
//! law -> clamped absolute target -> [`StageActuator::move_z_um`]
//!
//! The [`calibration`] module measures the error-to-Z slope with a stage
//! sweep. [`FocusController`] runs one control step per frame, and
//! [`worker::FocusWorker`] drives it from a dedicated thread.
//!
//! Every target is clamped to the configured stage travel and to a window
//! of `af_max_excursion_um` around the Z where the lock started, so a bad
//! measurement can never walk the stage away without bound.

use shared::camera_interface::Frame;
use shared::image_proc::{centroid_near_edge, extract, ErrorSample, Roi};
use shared::stage_interface::StageActuator;

pub mod calibration;
pub mod callback;
pub mod config;
pub mod controllers;
pub mod error;
pub mod handle;
pub mod state;
pub mod worker;

use crate::controllers::PiController;
use crate::handle::{check_roi, RunRequest};

// Re-export commonly used types for external use
pub use crate::calibration::{CalibrationError, CalibrationReport, CalibrationSample, FocusCalibration};
pub use crate::callback::{CallbackId, CorrectedSample, SampleCallback, SampleStatus};
pub use crate::config::{FocusConfig, WorkerConfig};
pub use crate::error::FocusError;
pub use crate::handle::FocusHandle;
pub use crate::state::{FocusEvent, FocusState, FreezeReason};
pub use crate::worker::FocusWorker;

/// Where the active lock is anchored
#[derive(Debug, Clone, Copy)]
struct LockContext {
    /// ROI measured every step
    roi: Roi,
    /// Stage Z when locking started; centre of the excursion window
    lock_z_um: f64,
    /// Error captured at the last re-anchor, relative to the calibration's
    /// focus error; kept in the error domain so a slope swap cannot move it
    anchor_error: f64,
    /// Capture a new anchor on the next usable frame
    pending_anchor: bool,
    /// Number of ROI changes since locking started
    roi_generation: u64,
}

/// Focus lock state machine
///
/// Owns the stage while locked. All run-state changes go through
/// [`start`](Self::start), [`stop`](Self::stop) or the equivalent
/// [`FocusHandle`] requests.
pub struct FocusController<S: StageActuator> {
    config: FocusConfig,
    handle: FocusHandle,
    stage: S,
    pi: PiController,
    state: FocusState,
    lock: Option<LockContext>,
    last_frame_number: Option<u64>,
    /// Last target the stage accepted; fallback when readback fails
    last_commanded_z_um: Option<f64>,
    filtered_error_um: Option<f64>,
}

impl<S: StageActuator> FocusController<S> {
    /// Create an idle controller
    ///
    /// # Errors
    /// - [`FocusError::InvalidConfig`] if `config` fails validation
    /// - [`FocusError::Calibration`] if the slope sign disagrees with
    ///   `expected_positive_slope`
    pub fn new(config: FocusConfig, calibration: FocusCalibration, stage: S) -> Result<Self, FocusError> {
        config.validate()?;
        if let Some(expected) = config.expected_positive_slope {
            calibration::validate_sign(&calibration, expected)?;
        }
        let handle = FocusHandle::new(calibration.for_runtime(), config.expected_positive_slope);
        let pi = PiController::new(config.pi_gains());

        Ok(Self {
            config,
            handle,
            stage,
            pi,
            state: FocusState::Idle,
            lock: None,
            last_frame_number: None,
            last_commanded_z_um: None,
            filtered_error_um: None,
        })
    }

    /// Handle for controlling this lock from other threads
    pub fn handle(&self) -> FocusHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> FocusState {
        self.state
    }

    pub fn config(&self) -> &FocusConfig {
        &self.config
    }

    /// ROI of the active lock
    pub fn roi(&self) -> Option<Roi> {
        self.lock.map(|lock| lock.roi)
    }

    /// Stage Z at which the active lock started
    pub fn lock_z_um(&self) -> Option<f64> {
        self.lock.map(|lock| lock.lock_z_um)
    }

    pub fn integral_um(&self) -> f64 {
        self.pi.integral_um()
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Direct stage access; only meaningful while idle
    pub fn stage_mut(&mut self) -> &mut S {
        &mut self.stage
    }

    /// Install a new calibration (see [`FocusHandle::apply_calibration`])
    pub fn apply_calibration(&self, calibration: &FocusCalibration) -> Result<(), FocusError> {
        self.handle.apply_calibration(calibration)
    }

    /// Lock on `roi` at the current stage position
    ///
    /// Starting an active lock only moves it to `roi`.
    ///
    /// # Errors
    /// - [`FocusError::Roi`] for an empty ROI
    /// - [`FocusError::Stage`] if the stage position cannot be determined
    pub fn start(&mut self, roi: Roi) -> Result<(), FocusError> {
        check_roi(&roi)?;
        if self.state.is_active() {
            log::info!("Focus lock already active, switching ROI to {roi}");
            return self.set_roi(roi);
        }

        let lock_z_um = match self.stage.get_z_um() {
            Ok(z) => z,
            Err(e) => match self.last_commanded_z_um {
                Some(z) => {
                    log::warn!("Stage readback failed at lock start ({e}), using last command {z:.3} um");
                    z
                }
                None => return Err(e.into()),
            },
        };

        self.pi.set_enabled(true);
        self.pi.set_hold(false);
        self.lock = Some(LockContext {
            roi,
            lock_z_um,
            anchor_error: 0.0,
            pending_anchor: self.config.anchor_on_start,
            roi_generation: 0,
        });
        self.last_frame_number = None;
        self.filtered_error_um = None;
        self.transition(FocusState::Locked {
            frames_processed: 0,
        });
        log::info!("Focus lock started on ROI {roi} at z = {lock_z_um:.3} um");
        Ok(())
    }

    /// Release the lock; the integral is cleared
    pub fn stop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        self.pi.set_enabled(false);
        self.lock = None;
        self.filtered_error_um = None;
        self.transition(FocusState::Idle);
        log::info!("Focus lock stopped");
    }

    /// Move the active lock to `roi`
    ///
    /// The calibration slope is kept. On the next usable frame the current
    /// offset is captured as the new setpoint and the integral is cleared,
    /// so the switch produces no jump. Ignored while idle.
    pub fn set_roi(&mut self, roi: Roi) -> Result<(), FocusError> {
        check_roi(&roi)?;
        match self.lock.as_mut() {
            Some(lock) if lock.roi != roi => {
                lock.roi = roi;
                lock.pending_anchor = true;
                lock.roi_generation += 1;
                log::info!("Focus ROI changed to {roi}, re-anchoring on next frame");
            }
            Some(_) => {}
            None => log::debug!("Ignoring ROI change to {roi} while idle"),
        }
        Ok(())
    }

    /// Drive the state machine with one event
    ///
    /// Returns the telemetry sample for [`FocusEvent::ProcessFrame`].
    pub fn process_event(&mut self, event: FocusEvent<'_>) -> Result<Option<CorrectedSample>, FocusError> {
        match event {
            FocusEvent::Start(roi) => self.start(roi).map(|_| None),
            FocusEvent::Stop => {
                self.stop();
                Ok(None)
            }
            FocusEvent::SetRoi(roi) => self.set_roi(roi).map(|_| None),
            FocusEvent::ProcessFrame(frame) => Ok(Some(self.step(frame))),
        }
    }

    /// Run one control step on `frame`
    ///
    /// Never fails: measurement, freeze and stage problems are reported in
    /// the returned sample's [`SampleStatus`].
    pub fn step(&mut self, frame: &Frame) -> CorrectedSample {
        let start_fault = self.apply_pending();
        let mut sample = CorrectedSample::new(frame.frame_number, frame.timestamp, self.state);
        sample.integral_um = self.pi.integral_um();

        if let Some(message) = start_fault {
            sample.status = SampleStatus::Fault(message);
            return sample;
        }

        let Some(roi) = self.lock.map(|lock| lock.roi) else {
            return sample;
        };
        sample.roi = Some(roi);

        if let Some(last) = self.last_frame_number {
            if frame.frame_number <= last {
                log::debug!("Skipping duplicate frame #{}", frame.frame_number);
                sample.status = SampleStatus::SkippedDuplicate;
                return sample;
            }
        }
        self.last_frame_number = Some(frame.frame_number);

        let measurement = match extract(frame, &roi, &self.config.extractor) {
            Ok(measurement) => measurement,
            Err(e) => {
                log::warn!("Frame #{} not measurable: {e}", frame.frame_number);
                sample.status = SampleStatus::Fault(e.to_string());
                return sample;
            }
        };
        sample.error = measurement.error;
        sample.intensity = measurement.intensity;
        sample.low_signal = measurement.low_signal;

        let current_z_um = self.current_z_um();
        sample.stage_z_um = Some(current_z_um);

        if let Some(reason) = self.freeze_reason(&measurement, &roi) {
            self.freeze(reason);
            sample.state = self.state;
            sample.status = SampleStatus::Frozen(reason);
            sample.integral_um = self.pi.integral_um();
            return sample;
        }
        self.resume();

        let calibration = self.handle.calibration();
        let lock_z_um = match self.lock.as_mut() {
            Some(lock) => {
                if lock.pending_anchor {
                    lock.anchor_error = measurement.error - calibration.error_at_focus();
                    lock.pending_anchor = false;
                    self.pi.reset();
                    self.filtered_error_um = None;
                    log::info!(
                        "Anchored focus setpoint on ROI {} (generation {}): error {:+.4}",
                        lock.roi,
                        lock.roi_generation,
                        lock.anchor_error
                    );
                }
                sample.z_offset_um = calibration.z_offset_um(measurement.error - lock.anchor_error);
                lock.lock_z_um
            }
            None => return sample,
        };

        let mut error_um = -sample.z_offset_um;
        if let Some(previous) = self.filtered_error_um {
            let alpha = self.config.error_alpha;
            error_um = alpha * previous + (1.0 - alpha) * error_um;
        }
        self.filtered_error_um = Some(error_um);
        sample.error_um = error_um;

        let output = self.pi.update(error_um);
        sample.command_delta_um = output.delta_um;
        sample.slew_limited = output.slew_limited;
        self.count_processed();
        sample.state = self.state;

        let raw_target = current_z_um + output.delta_um;
        let target = self.clamp_target(raw_target, lock_z_um);
        sample.commanded_z_um = Some(target);
        sample.clamped = target != raw_target;

        // Nothing is sent inside the deadband, so nothing may be integrated
        if output.delta_um.abs() < self.config.command_deadband_um {
            self.pi.unwind();
            sample.status = SampleStatus::Deadband;
            sample.integral_um = self.pi.integral_um();
            return sample;
        }

        if sample.clamped {
            self.pi.unwind();
            log::debug!("Target {raw_target:.4} um clamped to {target:.4} um");
        }
        sample.integral_um = self.pi.integral_um();

        sample.status = match self.stage.move_z_um(target) {
            Ok(()) => {
                self.last_commanded_z_um = Some(target);
                SampleStatus::Applied
            }
            Err(e) => {
                log::warn!("Stage command to {target:.4} um failed: {e}");
                SampleStatus::CommandFailed(e.to_string())
            }
        };

        log::debug!(
            "Frame #{}: error {:+.4}, offset {:+.4} um, delta {:+.4} um -> {target:.4} um",
            frame.frame_number,
            measurement.error,
            sample.z_offset_um,
            output.delta_um
        );
        sample
    }

    /// Apply queued handle requests; returns a message if a start failed
    fn apply_pending(&mut self) -> Option<String> {
        let pending = self.handle.take_pending();
        let mut fault = None;

        match pending.run {
            Some(RunRequest::Start(roi)) => {
                if let Err(e) = self.start(roi) {
                    log::warn!("Requested focus lock start failed: {e}");
                    fault = Some(format!("start failed: {e}"));
                }
            }
            Some(RunRequest::Stop) => self.stop(),
            None => {}
        }
        if let Some(roi) = pending.roi {
            if let Err(e) = self.set_roi(roi) {
                log::warn!("Requested ROI change failed: {e}");
            }
        }
        fault
    }

    /// Readback, else the last accepted command, else the lock position
    fn current_z_um(&mut self) -> f64 {
        let fallback = self
            .last_commanded_z_um
            .or_else(|| self.lock.map(|lock| lock.lock_z_um))
            .unwrap_or(0.0);
        if !self.stage.supports_readback() {
            return fallback;
        }
        match self.stage.get_z_um() {
            Ok(z) if z.is_finite() => z,
            Ok(z) => {
                log::warn!("Stage reported non-finite position {z}, assuming {fallback:.4} um");
                fallback
            }
            Err(e) => {
                log::warn!("Stage readback failed ({e}), assuming {fallback:.4} um");
                fallback
            }
        }
    }

    fn freeze_reason(&self, measurement: &ErrorSample, roi: &Roi) -> Option<FreezeReason> {
        if measurement.intensity < self.config.min_roi_intensity {
            Some(FreezeReason::LowIntensity)
        } else if measurement.low_signal {
            Some(FreezeReason::LowSignal)
        } else if self.config.edge_margin_px > 0.0
            && centroid_near_edge(measurement, roi, self.config.edge_margin_px)
        {
            Some(FreezeReason::NearEdge)
        } else {
            None
        }
    }

    fn freeze(&mut self, reason: FreezeReason) {
        let next = match self.state {
            FocusState::Frozen {
                reason: current,
                frames_frozen,
            } if current == reason => FocusState::Frozen {
                reason,
                frames_frozen: frames_frozen + 1,
            },
            _ => {
                log::info!("Focus lock frozen: {reason}");
                FocusState::Frozen {
                    reason,
                    frames_frozen: 1,
                }
            }
        };
        self.pi.set_hold(true);
        self.transition(next);
    }

    fn resume(&mut self) {
        if let FocusState::Frozen { frames_frozen, .. } = self.state {
            log::info!("Focus signal recovered after {frames_frozen} frozen frames, resuming lock");
            self.pi.set_hold(false);
            self.transition(FocusState::Locked {
                frames_processed: 0,
            });
        }
    }

    fn count_processed(&mut self) {
        if let FocusState::Locked { frames_processed } = self.state {
            self.transition(FocusState::Locked {
                frames_processed: frames_processed + 1,
            });
        }
    }

    /// Stage travel first, then the excursion window around `lock_z_um`
    fn clamp_target(&self, target_um: f64, lock_z_um: f64) -> f64 {
        let mut target = target_um;
        if let Some(min) = self.config.stage_min_um {
            target = target.max(min);
        }
        if let Some(max) = self.config.stage_max_um {
            target = target.min(max);
        }
        if self.config.excursion_enabled() {
            let excursion = self.config.af_max_excursion_um;
            target = target.clamp(lock_z_um - excursion, lock_z_um + excursion);
        }
        target
    }

    fn transition(&mut self, state: FocusState) {
        self.state = state;
        self.handle.publish_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use shared::camera_interface::Timestamp;
    use shared::image_proc::test_patterns::astigmatic_spot;
    use shared::stage_interface::mock::MockStage;

    const ROI: Roi = Roi {
        x: 0,
        y: 0,
        width: 32,
        height: 32,
    };

    /// Spot whose error is positive for `dz > 0`
    fn spot_frame(dz: f64, frame_number: u64) -> Frame {
        let sx = 2.0 + 0.25 * dz;
        let sy = 2.0 - 0.25 * dz;
        let data = astigmatic_spot(32, 32, 15.5, 15.5, sx, sy, 4000.0, 100.0);
        Frame::new(data, frame_number, Timestamp::new(frame_number, 0))
    }

    fn blank_frame(frame_number: u64) -> Frame {
        Frame::new(
            Array2::from_elem((32, 32), 100),
            frame_number,
            Timestamp::new(frame_number, 0),
        )
    }

    fn controller(config: FocusConfig, stage: MockStage) -> FocusController<MockStage> {
        FocusController::new(config, FocusCalibration::new(0.0, 4.0).unwrap(), stage).unwrap()
    }

    #[test]
    fn test_idle_never_commands() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());

        let sample = fc.step(&spot_frame(1.0, 1));
        assert_eq!(sample.status, SampleStatus::Idle);
        assert_eq!(sample.state, FocusState::Idle);
        assert!(sample.roi.is_none());
        assert_eq!(stage.move_attempts(), 0);
    }

    #[test]
    fn test_above_focus_commands_down() {
        let stage = MockStage::new(10.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();
        assert_eq!(fc.lock_z_um(), Some(10.0));

        let sample = fc.step(&spot_frame(1.0, 1));
        assert!(sample.status.applied());
        assert!(sample.error > 0.0);
        assert!(sample.z_offset_um > 0.0);
        assert!(sample.command_delta_um < 0.0);
        assert!(stage.position_um() < 10.0);
        assert_eq!(sample.state, FocusState::Locked { frames_processed: 1 });
    }

    #[test]
    fn test_slew_limit_bounds_each_step() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();

        let sample = fc.step(&spot_frame(4.0, 1));
        assert_relative_eq!(sample.command_delta_um, -0.25);
        assert!(sample.slew_limited);
        assert_relative_eq!(stage.position_um(), -0.25);

        let sample = fc.step(&spot_frame(0.1, 2));
        assert!(!sample.slew_limited);
    }

    #[test]
    fn test_stage_limits_clamp_and_unwind() {
        let stage = MockStage::new(0.0);
        let config = FocusConfig {
            stage_min_um: Some(-0.1),
            ..Default::default()
        };
        let mut fc = controller(config, stage.clone());
        fc.start(ROI).unwrap();

        let sample = fc.step(&spot_frame(1.0, 1));
        assert!(sample.clamped);
        assert_eq!(sample.commanded_z_um, Some(-0.1));
        assert_eq!(stage.position_um(), -0.1);
        // The clamped step left no integral behind
        assert_eq!(sample.integral_um, 0.0);
        assert_eq!(fc.integral_um(), 0.0);
    }

    #[test]
    fn test_deadband_sends_nothing_and_holds_integral() {
        let stage = MockStage::new(0.0);
        let config = FocusConfig {
            command_deadband_um: 1.0,
            ..Default::default()
        };
        let mut fc = controller(config, stage.clone());
        fc.start(ROI).unwrap();

        for n in 1..=50 {
            let sample = fc.step(&spot_frame(0.2, n));
            assert_eq!(sample.status, SampleStatus::Deadband);
            assert_eq!(sample.integral_um, 0.0);
        }
        assert_eq!(stage.move_attempts(), 0);
        assert_eq!(fc.integral_um(), 0.0);
    }

    #[test]
    fn test_deadband_reports_clamped_target() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();

        // Pushed outside the excursion window by something other than the loop
        stage.set_position_um(7.0);
        let sample = fc.step(&spot_frame(0.0, 1));
        assert_eq!(sample.status, SampleStatus::Deadband);
        assert_eq!(sample.commanded_z_um, Some(5.0));
        assert!(sample.clamped);
        assert_eq!(stage.move_attempts(), 0);
    }

    #[test]
    fn test_low_signal_freezes_and_resumes() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();
        fc.step(&spot_frame(0.5, 1));
        let integral = fc.integral_um();
        let commands = stage.command_count();

        for n in 2..5 {
            let sample = fc.step(&blank_frame(n));
            assert_eq!(sample.status, SampleStatus::Frozen(FreezeReason::LowSignal));
            assert_eq!(sample.integral_um, integral);
        }
        assert_eq!(
            fc.state(),
            FocusState::Frozen {
                reason: FreezeReason::LowSignal,
                frames_frozen: 3
            }
        );
        assert_eq!(stage.command_count(), commands);

        let sample = fc.step(&spot_frame(0.5, 5));
        assert!(sample.status.applied());
        assert_eq!(fc.state(), FocusState::Locked { frames_processed: 1 });
    }

    #[test]
    fn test_min_intensity_freeze() {
        let stage = MockStage::new(0.0);
        let config = FocusConfig {
            min_roi_intensity: 1e9,
            ..Default::default()
        };
        let mut fc = controller(config, stage.clone());
        fc.start(ROI).unwrap();

        let sample = fc.step(&spot_frame(0.5, 1));
        assert_eq!(sample.status, SampleStatus::Frozen(FreezeReason::LowIntensity));
        assert_eq!(stage.move_attempts(), 0);
    }

    #[test]
    fn test_duplicate_frame_skipped() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();

        fc.step(&spot_frame(0.5, 7));
        let sample = fc.step(&spot_frame(0.5, 7));
        assert_eq!(sample.status, SampleStatus::SkippedDuplicate);
        assert_eq!(stage.command_count(), 1);
    }

    #[test]
    fn test_roi_outside_frame_is_fault() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(Roi::new(20, 20, 32, 32)).unwrap();

        let sample = fc.step(&spot_frame(0.5, 1));
        assert!(matches!(sample.status, SampleStatus::Fault(_)));
        assert_eq!(stage.move_attempts(), 0);
    }

    #[test]
    fn test_command_failure_keeps_running() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();
        stage.fail_next_moves(1);

        let sample = fc.step(&spot_frame(0.5, 1));
        assert!(matches!(sample.status, SampleStatus::CommandFailed(_)));
        assert!(fc.state().is_active());

        let sample = fc.step(&spot_frame(0.5, 2));
        assert!(sample.status.applied());
    }

    #[test]
    fn test_readback_failure_falls_back_to_last_command() {
        let stage = MockStage::new(1.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();
        fc.step(&spot_frame(0.5, 1));
        let commanded = stage.position_um();

        stage.set_readback_failure(true);
        let sample = fc.step(&spot_frame(0.5, 2));
        assert_eq!(sample.stage_z_um, Some(commanded));
        assert!(sample.status.applied());
    }

    #[test]
    fn test_start_without_position_fails() {
        let stage = MockStage::new(0.0);
        stage.set_readback_failure(true);
        let mut fc = controller(FocusConfig::default(), stage);
        assert!(matches!(fc.start(ROI), Err(FocusError::Stage(_))));
        assert_eq!(fc.state(), FocusState::Idle);
    }

    #[test]
    fn test_stop_resets_integral() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();
        fc.step(&spot_frame(0.5, 1));
        assert!(fc.integral_um() != 0.0);

        fc.stop();
        assert_eq!(fc.integral_um(), 0.0);
        assert_eq!(fc.state(), FocusState::Idle);
        assert_eq!(fc.handle().state(), FocusState::Idle);
    }

    #[test]
    fn test_set_roi_reanchors() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();
        fc.step(&spot_frame(0.0, 1));

        fc.set_roi(Roi::new(1, 1, 30, 30)).unwrap();
        let sample = fc.step(&spot_frame(2.0, 2));
        // Offset captured at the switch, so nothing to correct yet
        assert_relative_eq!(sample.z_offset_um, 0.0);
        assert_eq!(sample.status, SampleStatus::Deadband);
        assert_eq!(sample.integral_um, 0.0);
    }

    #[test]
    fn test_calibration_swap_keeps_anchor() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        fc.start(ROI).unwrap();
        fc.step(&spot_frame(0.0, 1));

        fc.set_roi(Roi::new(1, 1, 30, 30)).unwrap();
        let sample = fc.step(&spot_frame(2.0, 2));
        assert_relative_eq!(sample.z_offset_um, 0.0);

        // A steeper slope rescales offsets but the setpoint stays put
        fc.apply_calibration(&FocusCalibration::new(0.0, 8.0).unwrap()).unwrap();
        let sample = fc.step(&spot_frame(2.0, 3));
        assert_relative_eq!(sample.z_offset_um, 0.0);
        assert_eq!(sample.status, SampleStatus::Deadband);
        assert_eq!(stage.move_attempts(), 0);

        let sample = fc.step(&spot_frame(2.5, 4));
        assert!(sample.z_offset_um > 0.0);
        assert!(sample.status.applied());
    }

    #[test]
    fn test_handle_requests_applied_on_step() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage.clone());
        let handle = fc.handle();

        handle.start(ROI).unwrap();
        assert_eq!(handle.state(), FocusState::Idle);
        let sample = fc.step(&spot_frame(0.5, 1));
        assert!(sample.status.applied());
        assert!(handle.state().is_active());

        handle.stop();
        let sample = fc.step(&spot_frame(0.5, 2));
        assert_eq!(sample.status, SampleStatus::Idle);
        assert_eq!(handle.state(), FocusState::Idle);
    }

    #[test]
    fn test_process_event_dispatch() {
        let stage = MockStage::new(0.0);
        let mut fc = controller(FocusConfig::default(), stage);
        let frame = spot_frame(0.5, 1);

        assert!(fc.process_event(FocusEvent::Start(ROI)).unwrap().is_none());
        let sample = fc.process_event(FocusEvent::ProcessFrame(&frame)).unwrap();
        assert!(sample.is_some_and(|s| s.status.applied()));
        assert!(fc.process_event(FocusEvent::Stop).unwrap().is_none());
        assert_eq!(fc.state(), FocusState::Idle);
    }

    #[test]
    fn test_sign_mismatch_rejected_at_construction() {
        let config = FocusConfig {
            expected_positive_slope: Some(false),
            ..Default::default()
        };
        let result = FocusController::new(
            config,
            FocusCalibration::new(0.0, 4.0).unwrap(),
            MockStage::new(0.0),
        );
        assert!(matches!(result, Err(FocusError::Calibration(_))));
    }
}
