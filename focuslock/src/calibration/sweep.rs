//! Stage sweep execution
//!
//! Steps the stage through the configured targets and records the focus
//! error at each. A failed step is logged and skipped; the sweep as a whole
//! only fails when too few points survive.

use shared::camera_interface::{CameraError, Frame, FrameSource};
use shared::image_proc::{extract, Roi, RoiError};
use shared::stage_interface::{StageActuator, StageError};
use std::fmt;
use std::thread;
use std::time::Duration;

use super::config::SweepConfig;
use super::types::CalibrationSample;
use super::{CalibrationError, CancellationToken};

/// Why one sweep step produced no sample
#[derive(Debug, Clone)]
pub enum StepFailureKind {
    /// Every move attempt was rejected
    Move(StageError),
    /// No fresh frame could be acquired
    Frame(CameraError),
    /// The ROI does not fit the acquired frame
    Roi(RoiError),
}

impl fmt::Display for StepFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StepFailureKind::Move(e) => write!(f, "move failed: {e}"),
            StepFailureKind::Frame(e) => write!(f, "frame acquisition failed: {e}"),
            StepFailureKind::Roi(e) => write!(f, "ROI rejected: {e}"),
        }
    }
}

/// A skipped sweep step
#[derive(Debug, Clone)]
pub struct StepFailure {
    /// Zero-based position in the target list
    pub step_index: usize,
    pub target_um: f64,
    pub kind: StepFailureKind,
}

/// Progress of a running sweep, passed to the observer after every step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepProgress {
    /// One-based step number
    pub step: usize,
    pub total: usize,
    pub target_um: f64,
    /// Stage readback, when available
    pub measured_um: Option<f64>,
    /// The step produced a sample
    pub ok: bool,
}

/// Everything a sweep collected
#[derive(Debug, Clone)]
pub struct SweepReport {
    /// Valid samples in acquisition order
    pub samples: Vec<CalibrationSample>,
    /// Steps that were skipped
    pub failures: Vec<StepFailure>,
    /// Targets the sweep planned to visit
    pub requested: usize,
    /// The sweep stopped early on request
    pub cancelled: bool,
}

/// Run a calibration sweep
///
/// See [`sweep_with_progress`].
pub fn sweep<S, F>(
    stage: &mut S,
    frames: &mut F,
    roi: &Roi,
    config: &SweepConfig,
    cancel: &CancellationToken,
) -> Result<SweepReport, CalibrationError>
where
    S: StageActuator + ?Sized,
    F: FrameSource + ?Sized,
{
    sweep_with_progress(stage, frames, roi, config, cancel, |_| {})
}

/// Run a calibration sweep, reporting each step to `on_step`
///
/// Cancellation is checked before each move. A cancelled sweep returns
/// `Ok` with the samples gathered so far and `cancelled` set; no stage
/// command is issued after the cancellation is observed.
///
/// # Errors
/// - [`CalibrationError::InvalidConfig`] before any motion if the config is invalid
/// - [`CalibrationError::InsufficientCalibrationData`] if a completed sweep
///   kept fewer than `min_success_fraction` of its points (and at least 2)
pub fn sweep_with_progress<S, F, P>(
    stage: &mut S,
    frames: &mut F,
    roi: &Roi,
    config: &SweepConfig,
    cancel: &CancellationToken,
    mut on_step: P,
) -> Result<SweepReport, CalibrationError>
where
    S: StageActuator + ?Sized,
    F: FrameSource + ?Sized,
    P: FnMut(&SweepProgress),
{
    config.validate()?;
    if roi.width == 0 || roi.height == 0 {
        return Err(CalibrationError::InvalidConfig(format!(
            "empty calibration ROI {roi}"
        )));
    }

    let targets = config.targets();
    let total = targets.len();
    let readback = stage.supports_readback();
    let mut report = SweepReport {
        samples: Vec::with_capacity(total),
        failures: Vec::new(),
        requested: total,
        cancelled: false,
    };
    let mut last_frame_number: Option<u64> = None;

    log::info!(
        "Starting calibration sweep: {total} steps over [{:.3}, {:.3}] um, ROI {roi}",
        config.z_min_um,
        config.z_max_um
    );

    for (index, &target) in targets.iter().enumerate() {
        if cancel.is_cancelled() {
            log::info!("Calibration sweep cancelled after {index} of {total} steps");
            report.cancelled = true;
            break;
        }

        let outcome = run_step(stage, frames, roi, config, target, readback, &mut last_frame_number);
        let progress = match outcome {
            Ok(sample) => {
                log::debug!(
                    "Step {}/{total}: target {target:.3} um, z {:.3} um, error {:+.4}",
                    index + 1,
                    sample.z_um(),
                    sample.error
                );
                report.samples.push(sample);
                SweepProgress {
                    step: index + 1,
                    total,
                    target_um: target,
                    measured_um: sample.measured_z_um,
                    ok: true,
                }
            }
            Err(kind) => {
                log::warn!("Step {}/{total} at {target:.3} um skipped: {kind}", index + 1);
                report.failures.push(StepFailure {
                    step_index: index,
                    target_um: target,
                    kind,
                });
                SweepProgress {
                    step: index + 1,
                    total,
                    target_um: target,
                    measured_um: None,
                    ok: false,
                }
            }
        };
        on_step(&progress);
    }

    if report.cancelled {
        return Ok(report);
    }

    let required = config.required_points(total);
    if report.samples.len() < required {
        return Err(CalibrationError::InsufficientCalibrationData {
            valid: report.samples.len(),
            requested: total,
            required,
        });
    }

    log::info!(
        "Calibration sweep complete: {} of {total} points, {} skipped",
        report.samples.len(),
        report.failures.len()
    );
    Ok(report)
}

fn run_step<S, F>(
    stage: &mut S,
    frames: &mut F,
    roi: &Roi,
    config: &SweepConfig,
    target: f64,
    readback: bool,
    last_frame_number: &mut Option<u64>,
) -> Result<CalibrationSample, StepFailureKind>
where
    S: StageActuator + ?Sized,
    F: FrameSource + ?Sized,
{
    move_with_retry(stage, target, config).map_err(StepFailureKind::Move)?;
    sleep_if_nonzero(config.settle_time);

    // A silent readback leaves the commanded position as the record
    let measured_z_um = if readback {
        match settled_readback(stage, target, config) {
            Ok(z) => Some(z),
            Err(e) => {
                log::warn!("Stage readback failed at {target:.3} um ({e}), recording commanded position");
                None
            }
        }
    } else {
        None
    };

    let frame = fresh_frame(frames, config, last_frame_number).map_err(StepFailureKind::Frame)?;
    let measurement = extract(&frame, roi, &config.extractor).map_err(StepFailureKind::Roi)?;

    Ok(CalibrationSample {
        commanded_z_um: target,
        measured_z_um,
        error: measurement.error,
        intensity: measurement.intensity,
    })
}

/// Command `target`, retrying with exponential backoff
fn move_with_retry<S>(stage: &mut S, target: f64, config: &SweepConfig) -> Result<(), StageError>
where
    S: StageActuator + ?Sized,
{
    let mut attempt = 0;
    loop {
        match stage.move_z_um(target) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.move_retries => {
                let backoff = config.retry_backoff * (1u32 << attempt.min(6));
                log::debug!("Move to {target:.3} um rejected ({e}), retrying in {backoff:?}");
                sleep_if_nonzero(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll the readback until it is within tolerance of `target`
///
/// Returns the last good reading even if it never converged, so a stage that
/// clamps at its travel limit records where it actually stopped.
fn settled_readback<S>(stage: &mut S, target: f64, config: &SweepConfig) -> Result<f64, StageError>
where
    S: StageActuator + ?Sized,
{
    let polls = config.max_settle_polls.max(1);
    let mut last_ok = None;
    let mut last_err = None;

    for poll in 0..polls {
        match stage.get_z_um() {
            Ok(z) if (z - target).abs() <= config.settle_tolerance_um => return Ok(z),
            Ok(z) => last_ok = Some(z),
            Err(e) => last_err = Some(e),
        }
        if poll + 1 < polls {
            sleep_if_nonzero(config.settle_poll_interval);
        }
    }

    match (last_ok, last_err) {
        (Some(z), _) => {
            log::warn!(
                "Stage did not settle at {target:.3} um within {:.3} um, recording {z:.3} um",
                config.settle_tolerance_um
            );
            Ok(z)
        }
        (None, Some(e)) => Err(e),
        (None, None) => Err(StageError::Timeout(format!(
            "no readback at {target:.3} um"
        ))),
    }
}

/// Acquire a frame newer than the last one used
fn fresh_frame<F>(
    frames: &mut F,
    config: &SweepConfig,
    last_frame_number: &mut Option<u64>,
) -> Result<Frame, CameraError>
where
    F: FrameSource + ?Sized,
{
    let mut stale = 0;
    loop {
        let frame = frames.get_frame(config.frame_timeout)?;
        match *last_frame_number {
            Some(last) if frame.frame_number <= last => {
                stale += 1;
                if stale > config.max_duplicate_frames {
                    return Err(CameraError::DuplicateFrame(frame.frame_number));
                }
            }
            _ => {
                *last_frame_number = Some(frame.frame_number);
                return Ok(frame);
            }
        }
    }
}

fn sleep_if_nonzero(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
