//! Test doubles for [`FrameSource`]
//!
//! [`MockFrameSource`] replays a script of frames and faults.
//! [`SimulatedScope`] renders an astigmatic spot whose shape follows the Z
//! position of a [`MockStage`], closing the loop for controller and sweep
//! tests without hardware.

use super::{CameraError, CameraResult, Frame, FrameSource, Timestamp};
use crate::image_proc::test_patterns::{add_read_noise, astigmatic_spot};
use crate::stage_interface::mock::MockStage;
use ndarray::Array2;
use std::collections::VecDeque;
use std::time::Duration;

/// One scripted delivery of a [`MockFrameSource`]
#[derive(Debug, Clone)]
pub enum MockFrameEvent {
    /// Deliver this image as a new frame
    Image(Array2<u16>),
    /// Re-deliver the previous frame with its original frame number
    Duplicate,
    /// Report [`CameraError::Timeout`]
    Timeout,
    /// Report [`CameraError::CaptureError`]
    Error(String),
}

/// Scripted frame source
///
/// Events are consumed in order. Once the script is exhausted a source built
/// with [`MockFrameSource::new_repeating`] keeps delivering its last image
/// under fresh frame numbers; otherwise it reports a capture error.
pub struct MockFrameSource {
    script: VecDeque<MockFrameEvent>,
    last: Option<Frame>,
    repeat_last: bool,
    frame_count: u64,
    frame_period: Duration,
    elapsed: Duration,
}

impl MockFrameSource {
    pub fn new(frames: Vec<Array2<u16>>) -> Self {
        Self::from_script(frames.into_iter().map(MockFrameEvent::Image).collect())
    }

    pub fn new_repeating(frame: Array2<u16>) -> Self {
        let mut source = Self::new(vec![frame]);
        source.repeat_last = true;
        source
    }

    pub fn from_script(script: Vec<MockFrameEvent>) -> Self {
        Self {
            script: script.into(),
            last: None,
            repeat_last: false,
            frame_count: 0,
            frame_period: Duration::from_millis(33),
            elapsed: Duration::ZERO,
        }
    }

    /// Keep delivering the last image after the script runs out
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Append an event to the end of the script
    pub fn push(&mut self, event: MockFrameEvent) {
        self.script.push_back(event);
    }

    /// Number of distinct frames delivered so far
    pub fn frames_delivered(&self) -> u64 {
        self.frame_count
    }

    fn next_frame(&mut self, data: Array2<u16>) -> Frame {
        self.frame_count += 1;
        self.elapsed += self.frame_period;
        let frame = Frame::new(
            data,
            self.frame_count,
            Timestamp::from_duration(self.elapsed),
        );
        self.last = Some(frame.clone());
        frame
    }
}

impl FrameSource for MockFrameSource {
    fn get_frame(&mut self, timeout: Duration) -> CameraResult<Frame> {
        match self.script.pop_front() {
            Some(MockFrameEvent::Image(data)) => Ok(self.next_frame(data)),
            Some(MockFrameEvent::Duplicate) => self
                .last
                .clone()
                .ok_or_else(|| CameraError::CaptureError("No frame to duplicate".to_string())),
            Some(MockFrameEvent::Timeout) => Err(CameraError::Timeout(timeout)),
            Some(MockFrameEvent::Error(msg)) => Err(CameraError::CaptureError(msg)),
            None => match (&self.last, self.repeat_last) {
                (Some(last), true) => {
                    let data = last.data.clone();
                    Ok(self.next_frame(data))
                }
                _ => Err(CameraError::CaptureError("No more frames".to_string())),
            },
        }
    }

    fn name(&self) -> &str {
        "MockFrameSource"
    }
}

/// A bead in the simulated field of view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedBead {
    /// Column of the bead centre, pixels
    pub x: f64,
    /// Row of the bead centre, pixels
    pub y: f64,
    /// Stage Z at which this bead is in focus
    pub focal_plane_um: f64,
}

/// Renders astigmatic bead images from the position of a [`MockStage`]
///
/// For a defocus `dz = z - focal_plane_um` each bead is drawn with
/// `sigma_x = max(min_sigma, sigma0 + alpha * dz)` and
/// `sigma_y = max(min_sigma, sigma0 - alpha * dz)`, so the focus error is
/// positive above focus and negative below.
pub struct SimulatedScope {
    stage: MockStage,
    beads: Vec<SimulatedBead>,
    width: usize,
    height: usize,
    sigma0_px: f64,
    alpha_px_per_um: f64,
    min_sigma_px: f64,
    peak: f64,
    background: f64,
    read_noise: f64,
    seed: u64,
    drift_um_per_frame: f64,
    frame_count: u64,
    frame_period: Duration,
}

impl SimulatedScope {
    /// Single bead centred in a 64x64 frame, in focus at `focal_plane_um`
    pub fn new(stage: MockStage, focal_plane_um: f64) -> Self {
        let (width, height) = (64, 64);
        Self {
            stage,
            beads: vec![SimulatedBead {
                x: (width as f64 - 1.0) / 2.0,
                y: (height as f64 - 1.0) / 2.0,
                focal_plane_um,
            }],
            width,
            height,
            sigma0_px: 2.0,
            alpha_px_per_um: 0.25,
            min_sigma_px: 0.6,
            peak: 4095.0,
            background: 100.0,
            read_noise: 0.0,
            seed: 0,
            drift_um_per_frame: 0.0,
            frame_count: 0,
            frame_period: Duration::from_millis(33),
        }
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Replace the bead list
    pub fn with_beads(mut self, beads: Vec<SimulatedBead>) -> Self {
        self.beads = beads;
        self
    }

    pub fn with_optics(mut self, sigma0_px: f64, alpha_px_per_um: f64) -> Self {
        self.sigma0_px = sigma0_px;
        self.alpha_px_per_um = alpha_px_per_um;
        self
    }

    pub fn with_signal(mut self, peak: f64, background: f64) -> Self {
        self.peak = peak;
        self.background = background;
        self
    }

    /// Seeded Gaussian read noise, DN rms
    pub fn with_read_noise(mut self, sigma: f64, seed: u64) -> Self {
        self.read_noise = sigma;
        self.seed = seed;
        self
    }

    /// Move every focal plane by this much per delivered frame
    pub fn with_drift(mut self, um_per_frame: f64) -> Self {
        self.drift_um_per_frame = um_per_frame;
        self
    }

    pub fn beads(&self) -> &[SimulatedBead] {
        &self.beads
    }

    /// Widths `(sigma_x, sigma_y)` of a bead at the given defocus
    pub fn sigmas(&self, dz_um: f64) -> (f64, f64) {
        let sx = (self.sigma0_px + self.alpha_px_per_um * dz_um).max(self.min_sigma_px);
        let sy = (self.sigma0_px - self.alpha_px_per_um * dz_um).max(self.min_sigma_px);
        (sx, sy)
    }

    /// Render the scene for a stage at `z_um`
    pub fn render(&self, z_um: f64) -> Array2<u16> {
        let mut image = Array2::<f64>::from_elem((self.height, self.width), self.background);
        for bead in &self.beads {
            let (sx, sy) = self.sigmas(z_um - bead.focal_plane_um);
            let spot = astigmatic_spot(
                self.width, self.height, bead.x, bead.y, sx, sy, self.peak, 0.0,
            );
            image.zip_mut_with(&spot, |acc, &v| *acc += v as f64);
        }
        let rendered = image.mapv(|v| v.round().clamp(0.0, u16::MAX as f64) as u16);
        if self.read_noise > 0.0 {
            add_read_noise(&rendered, self.read_noise, self.seed.wrapping_add(self.frame_count))
        } else {
            rendered
        }
    }
}

impl FrameSource for SimulatedScope {
    fn get_frame(&mut self, _timeout: Duration) -> CameraResult<Frame> {
        let z = self.stage.position_um();
        let data = self.render(z);

        self.frame_count += 1;
        if self.drift_um_per_frame != 0.0 {
            for bead in &mut self.beads {
                bead.focal_plane_um += self.drift_um_per_frame;
            }
        }

        let timestamp = Timestamp::from_duration(self.frame_period * self.frame_count as u32);
        Ok(Frame::new(data, self.frame_count, timestamp))
    }

    fn name(&self) -> &str {
        "SimulatedScope"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_proc::{extract, Roi};

    #[test]
    fn test_script_order_and_faults() {
        let mut source = MockFrameSource::from_script(vec![
            MockFrameEvent::Image(Array2::zeros((4, 4))),
            MockFrameEvent::Duplicate,
            MockFrameEvent::Timeout,
            MockFrameEvent::Error("boom".to_string()),
            MockFrameEvent::Image(Array2::ones((4, 4))),
        ]);
        let wait = Duration::from_millis(5);

        assert_eq!(source.get_frame(wait).unwrap().frame_number, 1);
        assert_eq!(source.get_frame(wait).unwrap().frame_number, 1);
        assert_eq!(source.get_frame(wait).unwrap_err(), CameraError::Timeout(wait));
        assert!(matches!(
            source.get_frame(wait),
            Err(CameraError::CaptureError(_))
        ));
        assert_eq!(source.get_frame(wait).unwrap().frame_number, 2);
        assert!(source.get_frame(wait).is_err());
    }

    #[test]
    fn test_repeating_source_numbers_frames() {
        let mut source = MockFrameSource::new_repeating(Array2::zeros((4, 4)));
        let numbers: Vec<u64> = (0..4)
            .map(|_| source.get_frame(Duration::ZERO).unwrap().frame_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(source.frames_delivered(), 4);
    }

    #[test]
    fn test_scope_error_tracks_stage() {
        let stage = MockStage::new(0.0);
        let mut scope = SimulatedScope::new(stage.clone(), 10.0);
        let roi = Roi::new(0, 0, 64, 64);
        let opts = Default::default();

        stage.set_position_um(10.0);
        let at_focus = extract(&scope.get_frame(Duration::ZERO).unwrap(), &roi, &opts).unwrap();
        stage.set_position_um(12.0);
        let above = extract(&scope.get_frame(Duration::ZERO).unwrap(), &roi, &opts).unwrap();
        stage.set_position_um(8.0);
        let below = extract(&scope.get_frame(Duration::ZERO).unwrap(), &roi, &opts).unwrap();

        assert!(at_focus.error.abs() < 1e-3);
        assert!(above.error > 0.05);
        assert!(below.error < -0.05);
    }

    #[test]
    fn test_scope_drift_moves_focus() {
        let stage = MockStage::new(0.0);
        let mut scope = SimulatedScope::new(stage, 0.0).with_drift(0.5);
        scope.get_frame(Duration::ZERO).unwrap();
        scope.get_frame(Duration::ZERO).unwrap();
        assert_eq!(scope.beads()[0].focal_plane_um, 1.0);
    }
}
