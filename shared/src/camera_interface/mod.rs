//! Frame acquisition abstraction for the focus lock
//!
//! Provides a unified interface for pulling frames that can be backed by
//! either the simulator (for testing) or a real camera stream (for production).
//! The focus engine only ever borrows a [`Frame`] for the duration of one
//! extraction call.

pub mod mock;

use ndarray::{Array2, ArrayView2};
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Frame capture time, seconds plus nanoseconds since the source's epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    pub seconds: u64,
    /// Always below one second
    pub nanos: u64,
}

impl Timestamp {
    pub fn new(seconds: u64, nanos: u64) -> Self {
        Self { seconds, nanos }
    }

    /// Time elapsed since the source started streaming
    pub fn from_duration(elapsed: Duration) -> Self {
        Self {
            seconds: elapsed.as_secs(),
            nanos: u64::from(elapsed.subsec_nanos()),
        }
    }

    /// Seconds as a float, convenient for logging and CSV export
    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + self.nanos as f64 * 1e-9
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// Error type for frame acquisition
#[derive(Debug, Clone, PartialEq)]
pub enum CameraError {
    /// No frame arrived before the deadline
    Timeout(Duration),
    /// The source delivered a frame that was already consumed
    DuplicateFrame(u64),
    /// The source failed to deliver a frame
    CaptureError(String),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CameraError::Timeout(wait) => write!(f, "Frame timeout after {wait:?}"),
            CameraError::DuplicateFrame(n) => write!(f, "Duplicate frame #{n}"),
            CameraError::CaptureError(msg) => write!(f, "Capture error: {msg}"),
        }
    }
}

impl Error for CameraError {}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// A single immutable camera frame
///
/// `frame_number` increases monotonically for a given source and is used to
/// reject duplicate deliveries.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel intensities, indexed `[row, col]`
    pub data: Array2<u16>,
    /// Monotonic capture sequence number
    pub frame_number: u64,
    /// Capture time
    pub timestamp: Timestamp,
}

impl Frame {
    /// Wrap pixel data with its sequence number and capture time
    pub fn new(data: Array2<u16>, frame_number: u64, timestamp: Timestamp) -> Self {
        Self {
            data,
            frame_number,
            timestamp,
        }
    }

    /// Frame width in pixels
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Frame height in pixels
    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Borrow the pixel data
    pub fn view(&self) -> ArrayView2<'_, u16> {
        self.data.view()
    }
}

/// Trait for a streaming frame source
///
/// Implementations must not block past `timeout`; on expiry they return
/// [`CameraError::Timeout`]. Sources are expected to hand out each frame only
/// once; consumers may additionally compare `frame_number`s.
pub trait FrameSource: Send {
    /// Fetch the next frame, waiting at most `timeout`
    fn get_frame(&mut self, timeout: Duration) -> CameraResult<Frame>;

    /// Human-readable name for logging
    fn name(&self) -> &str {
        "frame-source"
    }
}

impl FrameSource for Box<dyn FrameSource> {
    fn get_frame(&mut self, timeout: Duration) -> CameraResult<Frame> {
        (**self).get_frame(timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_duration() {
        let ts = Timestamp::from_duration(Duration::new(10, 123_456_789));
        assert_eq!(ts.seconds, 10);
        assert_eq!(ts.nanos, 123_456_789);

        let ts = Timestamp::from_duration(Duration::from_millis(1500));
        assert_eq!(ts.seconds, 1);
        assert_eq!(ts.nanos, 500_000_000);
    }

    #[test]
    fn test_timestamp_display_and_secs() {
        let ts = Timestamp::new(42, 123_456_789);
        assert_eq!(ts.to_string(), "42.123456789");
        assert!((ts.as_secs_f64() - 42.123456789).abs() < 1e-9);
    }

    #[test]
    fn test_frame_dimensions() {
        let frame = Frame::new(Array2::zeros((30, 40)), 7, Timestamp::default());
        assert_eq!(frame.width(), 40);
        assert_eq!(frame.height(), 30);
        assert_eq!(frame.frame_number, 7);
    }

    #[test]
    fn test_camera_error_display() {
        let err = CameraError::Timeout(Duration::from_millis(50));
        assert_eq!(err.to_string(), "Frame timeout after 50ms");
        assert_eq!(
            CameraError::DuplicateFrame(3).to_string(),
            "Duplicate frame #3"
        );
    }
}
