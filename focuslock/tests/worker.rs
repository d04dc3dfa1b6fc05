//! Background worker lifecycle, observers and stage ownership

mod common;

use common::{calibrate_near_focus, fast_sweep, full_roi, init_logging, wait_until};
use focuslock::calibration::{sweep, CancellationToken, SweepConfig};
use focuslock::{
    CorrectedSample, FocusConfig, FocusController, FocusError, FocusState, FocusWorker,
    SampleStatus, WorkerConfig,
};
use ndarray::Array2;
use shared::camera_interface::mock::{MockFrameEvent, MockFrameSource, SimulatedScope};
use shared::stage_interface::mock::MockStage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> FocusConfig {
    FocusConfig {
        loop_hz: 200.0,
        ..Default::default()
    }
}

fn scope_worker(stage: &MockStage, focal_plane_um: f64) -> FocusWorker<MockStage, SimulatedScope> {
    let calibration = calibrate_near_focus(stage);
    let scope = SimulatedScope::new(stage.clone(), focal_plane_um);
    let controller = FocusController::new(fast_config(), calibration, stage.clone()).unwrap();
    FocusWorker::new(controller, scope, WorkerConfig::default())
}

#[test]
fn test_start_and_stop_are_idempotent() {
    init_logging();

    let stage = MockStage::new(0.0);
    let worker = scope_worker(&stage, 0.0);
    assert!(!worker.is_running());

    worker.stop();
    worker.start().unwrap();
    worker.start().unwrap();
    assert!(worker.is_running());

    worker.stop();
    worker.stop();
    assert!(!worker.is_running());

    // Restartable
    worker.start().unwrap();
    assert!(worker.is_running());
}

#[test]
fn test_lock_through_handle_and_observe() {
    init_logging();

    let stage = MockStage::new(0.0);
    let worker = scope_worker(&stage, 0.6);
    let samples: Arc<Mutex<Vec<CorrectedSample>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let samples = samples.clone();
        worker.register_observer(move |sample| samples.lock().unwrap().push(sample.clone()));
    }
    assert_eq!(worker.observer_count(), 1);

    let handle = worker.handle();
    worker.start().unwrap();
    handle.start(full_roi()).unwrap();

    assert!(wait_until(WAIT, || (stage.position_um() - 0.6).abs() < 0.02));
    assert!(handle.state().is_active());
    assert!(samples
        .lock()
        .unwrap()
        .iter()
        .any(|s| s.status == SampleStatus::Applied));

    worker.stop();
    assert_eq!(handle.state(), FocusState::Idle);

    let seen = samples.lock().unwrap().len();
    let commands = stage.command_count();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(samples.lock().unwrap().len(), seen);
    assert_eq!(stage.command_count(), commands);
}

#[test]
fn test_observer_panic_does_not_stop_loop() {
    init_logging();

    let stage = MockStage::new(0.0);
    let worker = scope_worker(&stage, 0.0);
    let count = Arc::new(AtomicUsize::new(0));

    let panicking = worker.register_observer(|_| panic!("observer failure"));
    {
        let count = count.clone();
        worker.register_observer(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    worker.start().unwrap();
    assert!(wait_until(WAIT, || count.load(Ordering::SeqCst) >= 10));
    assert!(worker.is_running());

    assert!(worker.deregister_observer(panicking));
    assert!(!worker.deregister_observer(panicking));
    assert_eq!(worker.observer_count(), 1);
    worker.stop();
}

#[test]
fn test_frame_timeouts_skip_iterations() {
    init_logging();

    let frame = Array2::<u16>::from_elem((16, 16), 100);
    let frames = MockFrameSource::from_script(vec![
        MockFrameEvent::Timeout,
        MockFrameEvent::Timeout,
        MockFrameEvent::Error("sensor glitch".to_string()),
        MockFrameEvent::Image(frame),
    ])
    .repeating();
    let stage = MockStage::new(0.0);
    let controller = FocusController::new(
        fast_config(),
        focuslock::FocusCalibration::new(0.0, 4.0).unwrap(),
        stage,
    )
    .unwrap();
    let worker = FocusWorker::new(controller, frames, WorkerConfig::default());

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        worker.register_observer(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    worker.start().unwrap();
    assert!(wait_until(WAIT, || count.load(Ordering::SeqCst) >= 3));
    worker.stop();
}

#[test]
fn test_stage_exclusive_between_loop_and_sweep() {
    init_logging();

    let stage = MockStage::new(0.0);
    let worker = scope_worker(&stage, 0.0);

    worker.start().unwrap();
    assert!(matches!(
        worker.with_stage(|_, _| ()),
        Err(FocusError::StageBusy)
    ));
    worker.stop();

    let config = fast_sweep(SweepConfig::centered(0.0, 0.5, 0.1));
    let report = worker
        .with_stage(|stage, frames| {
            // The loop cannot take the stage back mid-sweep
            assert!(matches!(worker.start(), Err(FocusError::StageBusy)));
            sweep(stage, frames, &full_roi(), &config, &CancellationToken::new())
        })
        .unwrap()
        .unwrap();
    assert_eq!(report.samples.len(), 22);
    assert!(!worker.is_running());

    worker.start().unwrap();
    assert!(worker.is_running());
}

#[test]
fn test_with_stage_refused_while_locked() {
    let stage = MockStage::new(0.0);
    let calibration = calibrate_near_focus(&stage);
    let scope = SimulatedScope::new(stage.clone(), 0.0);
    let mut controller = FocusController::new(fast_config(), calibration, stage.clone()).unwrap();
    controller.start(full_roi()).unwrap();
    let worker = FocusWorker::new(controller, scope, WorkerConfig::default());

    assert!(matches!(
        worker.with_stage(|_, _| ()),
        Err(FocusError::StageBusy)
    ));
}
