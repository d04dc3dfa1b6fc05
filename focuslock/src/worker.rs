//! Background control loop
//!
//! [`FocusWorker`] runs [`FocusController::step`] on a dedicated thread at
//! the configured loop rate. Telemetry is handed to a second thread over a
//! bounded channel, so slow or panicking observers can never stall or crash
//! the control loop.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use shared::camera_interface::{CameraError, FrameSource};
use shared::stage_interface::StageActuator;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::callback::{CallbackId, CorrectedSample, SampleCallback};
use crate::config::WorkerConfig;
use crate::error::FocusError;
use crate::handle::FocusHandle;
use crate::FocusController;

type Callbacks = Arc<Mutex<HashMap<CallbackId, SampleCallback>>>;

struct WorkerThreads {
    control: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Runs a focus controller against a frame source on its own thread
///
/// The worker owns the stage and the frame source. While it runs, the lock
/// is steered only through [`FocusWorker::handle`]; while it is stopped,
/// [`FocusWorker::with_stage`] lends both out for a calibration sweep.
pub struct FocusWorker<S, F>
where
    S: StageActuator + 'static,
    F: FrameSource + 'static,
{
    controller: Arc<Mutex<FocusController<S>>>,
    frames: Arc<Mutex<F>>,
    handle: FocusHandle,
    config: WorkerConfig,
    period: Duration,
    stop_requested: Arc<AtomicBool>,
    calibrating: AtomicBool,
    threads: Mutex<Option<WorkerThreads>>,
    callbacks: Callbacks,
    next_callback_id: Mutex<CallbackId>,
}

impl<S, F> FocusWorker<S, F>
where
    S: StageActuator + 'static,
    F: FrameSource + 'static,
{
    /// Wrap a controller and frame source; the loop is not started
    pub fn new(controller: FocusController<S>, frames: F, config: WorkerConfig) -> Self {
        let handle = controller.handle();
        let period = Duration::from_secs_f64(1.0 / controller.config().loop_hz);
        Self {
            controller: Arc::new(Mutex::new(controller)),
            frames: Arc::new(Mutex::new(frames)),
            handle,
            config,
            period,
            stop_requested: Arc::new(AtomicBool::new(false)),
            calibrating: AtomicBool::new(false),
            threads: Mutex::new(None),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_callback_id: Mutex::new(0),
        }
    }

    /// Handle for start/stop/ROI/calibration requests
    pub fn handle(&self) -> FocusHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.threads).is_some()
    }

    /// Start the control and dispatch threads
    ///
    /// Starting a running worker does nothing.
    ///
    /// # Errors
    /// - [`FocusError::StageBusy`] while a calibration sweep holds the stage
    /// - [`FocusError::WorkerSpawn`] if a thread cannot be created
    pub fn start(&self) -> Result<(), FocusError> {
        let mut threads = lock(&self.threads);
        if threads.is_some() {
            return Ok(());
        }
        if self.calibrating.load(Ordering::SeqCst) {
            return Err(FocusError::StageBusy);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        let (tx, rx) = bounded(self.config.observer_queue_depth.max(1));

        let callbacks = self.callbacks.clone();
        let dispatcher = thread::Builder::new()
            .name("focus-dispatch".to_string())
            .spawn(move || dispatch_loop(rx, callbacks))
            .map_err(FocusError::WorkerSpawn)?;

        let controller = self.controller.clone();
        let frames = self.frames.clone();
        let stop = self.stop_requested.clone();
        let period = self.period;
        let frame_timeout = self.config.frame_timeout;
        let control = thread::Builder::new()
            .name("focus-control".to_string())
            .spawn(move || control_loop(controller, frames, tx, stop, period, frame_timeout))
            .map_err(FocusError::WorkerSpawn)?;

        *threads = Some(WorkerThreads {
            control,
            dispatcher,
        });
        log::info!(
            "Focus worker started at {:.1} Hz",
            1.0 / self.period.as_secs_f64()
        );
        Ok(())
    }

    /// Stop the loop and release the lock
    ///
    /// Blocks until the in-flight step has finished; no step runs after this
    /// returns. Observers still receive the samples already queued. Stopping
    /// a stopped worker does nothing.
    pub fn stop(&self) {
        let mut running = lock(&self.threads);
        let Some(threads) = running.take() else {
            return;
        };

        self.stop_requested.store(true, Ordering::SeqCst);
        if threads.control.join().is_err() {
            log::warn!("Focus control thread panicked");
        }
        if threads.dispatcher.join().is_err() {
            log::warn!("Focus dispatch thread panicked");
        }

        lock(&self.controller).stop();
        log::info!("Focus worker stopped");
    }

    /// Register an observer for every control sample
    ///
    /// Observers run on the dispatch thread, never on the control thread.
    pub fn register_observer<C>(&self, callback: C) -> CallbackId
    where
        C: Fn(&CorrectedSample) + Send + Sync + 'static,
    {
        let mut callbacks = lock(&self.callbacks);
        let mut next_id = lock(&self.next_callback_id);

        let callback_id = *next_id;
        *next_id += 1;

        callbacks.insert(callback_id, Arc::new(callback));
        callback_id
    }

    /// Remove an observer; returns whether it was registered
    pub fn deregister_observer(&self, callback_id: CallbackId) -> bool {
        lock(&self.callbacks).remove(&callback_id).is_some()
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Borrow the stage and frame source exclusively, e.g. for a sweep
    ///
    /// The worker refuses to start until `f` returns.
    ///
    /// # Errors
    /// [`FocusError::StageBusy`] if the loop is running, the lock is active,
    /// or another caller already holds the stage.
    pub fn with_stage<R>(&self, f: impl FnOnce(&mut S, &mut F) -> R) -> Result<R, FocusError> {
        {
            let threads = lock(&self.threads);
            if threads.is_some() {
                return Err(FocusError::StageBusy);
            }
            if self
                .calibrating
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(FocusError::StageBusy);
            }
        }

        let result = {
            let mut controller = lock(&self.controller);
            if controller.state().is_active() {
                None
            } else {
                let mut frames = lock(&self.frames);
                Some(f(controller.stage_mut(), &mut *frames))
            }
        };

        self.calibrating.store(false, Ordering::SeqCst);
        result.ok_or(FocusError::StageBusy)
    }
}

impl<S, F> Drop for FocusWorker<S, F>
where
    S: StageActuator + 'static,
    F: FrameSource + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

fn control_loop<S, F>(
    controller: Arc<Mutex<FocusController<S>>>,
    frames: Arc<Mutex<F>>,
    tx: Sender<CorrectedSample>,
    stop: Arc<AtomicBool>,
    period: Duration,
    frame_timeout: Duration,
) where
    S: StageActuator,
    F: FrameSource,
{
    while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();

        let frame = lock(&frames).get_frame(frame_timeout);
        match frame {
            Ok(frame) => {
                let sample = lock(&controller).step(&frame);
                match tx.try_send(sample) {
                    Ok(()) => {}
                    Err(TrySendError::Full(sample)) => {
                        log::warn!(
                            "Observer queue full, dropping sample for frame #{}",
                            sample.frame_number
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::warn!("Observer dispatch thread gone, stopping focus loop");
                        break;
                    }
                }
            }
            Err(CameraError::Timeout(wait)) => {
                log::warn!("No frame within {wait:?}, skipping iteration");
            }
            Err(e) => {
                log::warn!("Frame acquisition failed: {e}");
            }
        }

        let elapsed = started.elapsed();
        if elapsed < period && !stop.load(Ordering::SeqCst) {
            thread::sleep(period - elapsed);
        }
    }
}

fn dispatch_loop(rx: Receiver<CorrectedSample>, callbacks: Callbacks) {
    for sample in rx.iter() {
        let observers: Vec<SampleCallback> = lock(&callbacks).values().cloned().collect();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&sample))).is_err() {
                log::warn!(
                    "Observer panicked on frame #{}; continuing",
                    sample.frame_number
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
