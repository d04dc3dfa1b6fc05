//! Common utilities for focuslock integration tests

#![allow(dead_code)]

use focuslock::calibration::{fit, sweep, CancellationToken, FitConfig, SweepConfig};
use focuslock::{CorrectedSample, FocusCalibration, FocusController};
use shared::camera_interface::mock::SimulatedScope;
use shared::camera_interface::FrameSource;
use shared::image_proc::Roi;
use shared::stage_interface::mock::MockStage;
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Whole frame of the default 64x64 scope
pub fn full_roi() -> Roi {
    Roi::new(0, 0, 64, 64)
}

/// Sweep settings with every wait removed
pub fn fast_sweep(config: SweepConfig) -> SweepConfig {
    SweepConfig {
        settle_time: Duration::ZERO,
        settle_poll_interval: Duration::ZERO,
        retry_backoff: Duration::ZERO,
        frame_timeout: Duration::from_millis(10),
        ..config
    }
}

/// Calibrate against a noise-free scope in focus at z = 0
///
/// Leaves `stage` back at z = 0 with an empty command log.
pub fn calibrate_near_focus(stage: &MockStage) -> FocusCalibration {
    let mut scope = SimulatedScope::new(stage.clone(), 0.0);
    let mut driver = stage.clone();
    let config = fast_sweep(SweepConfig::centered(0.0, 0.3, 0.05));

    let report = sweep(
        &mut driver,
        &mut scope,
        &full_roi(),
        &config,
        &CancellationToken::new(),
    )
    .expect("sweep should succeed on a clean scope");
    let fitted = fit(&report.samples, &FitConfig::default()).expect("fit should succeed");

    stage.set_position_um(0.0);
    stage.clear_commands();
    fitted.calibration
}

/// Step the controller on `n` consecutive scope frames
pub fn run_steps(
    controller: &mut FocusController<MockStage>,
    scope: &mut SimulatedScope,
    n: usize,
) -> Vec<CorrectedSample> {
    (0..n)
        .map(|_| {
            let frame = scope
                .get_frame(Duration::ZERO)
                .expect("simulated scope never fails");
            controller.step(&frame)
        })
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
