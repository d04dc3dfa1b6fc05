//! Astigmatic focus error from second moments of a spot
//!
//! With a cylindrical lens in the detection path a point source images to an
//! ellipse whose long axis flips between X and Y as the sample passes through
//! focus. The normalised difference of the two axis spreads,
//! `(spread_x - spread_y) / (spread_x + spread_y)`, is therefore a signed,
//! dimensionless defocus signal in `[-1, 1]` that crosses zero at focus.
//!
//! Which sign corresponds to "above focus" depends on the optical layout;
//! the calibration fit absorbs it.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use super::roi::{Roi, RoiError};
use crate::camera_interface::{Frame, Timestamp};

/// Pedestal removed from the window before the moments are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackgroundMode {
    /// Subtract the window minimum
    #[default]
    Minimum,
    /// Subtract the window mean, clipping negatives to zero
    Mean,
    /// Use raw intensities
    None,
}

/// Tuning for [`extract`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractorOptions {
    /// Background model applied to the moment weights
    pub background: BackgroundMode,
    /// Spread sum (px²) below which the window is treated as blank
    pub min_spread_px2: f64,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            background: BackgroundMode::Minimum,
            min_spread_px2: 1e-9,
        }
    }
}

/// Intensity-weighted moments of a window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpotMoments {
    /// Sum of the background-subtracted weights
    pub weight: f64,
    /// Centroid column relative to the window origin
    pub x: f64,
    /// Centroid row relative to the window origin
    pub y: f64,
    /// Second central moment μ₂₀ (variance in x-direction)
    pub m_xx: f64,
    /// Second central moment μ₀₂ (variance in y-direction)
    pub m_yy: f64,
}

/// Focus error measured on one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorSample {
    /// Normalised anisotropy in `[-1, 1]`; zero when `low_signal`
    pub error: f64,
    /// Sum of raw pixel values inside the ROI
    pub intensity: f64,
    /// Window was blank after background removal
    pub low_signal: bool,
    /// μ₂₀ after background removal (px²)
    pub spread_x: f64,
    /// μ₀₂ after background removal (px²)
    pub spread_y: f64,
    /// Centroid column relative to the ROI origin
    pub centroid_x: f64,
    /// Centroid row relative to the ROI origin
    pub centroid_y: f64,
    /// Capture time of the source frame
    #[serde(skip)]
    pub timestamp: Timestamp,
}

impl ErrorSample {
    fn blank(intensity: f64, width: usize, height: usize, timestamp: Timestamp) -> Self {
        Self {
            error: 0.0,
            intensity,
            low_signal: true,
            spread_x: 0.0,
            spread_y: 0.0,
            centroid_x: (width as f64 - 1.0) / 2.0,
            centroid_y: (height as f64 - 1.0) / 2.0,
            timestamp,
        }
    }
}

/// Compute background-subtracted centroid and axis variances of a window
pub fn spot_moments(window: &ArrayView2<u16>, background: BackgroundMode) -> SpotMoments {
    let n = window.len();
    if n == 0 {
        return SpotMoments::default();
    }

    let pedestal = match background {
        BackgroundMode::Minimum => window.iter().copied().min().unwrap_or(0) as f64,
        BackgroundMode::Mean => window.iter().map(|&v| v as f64).sum::<f64>() / n as f64,
        BackgroundMode::None => 0.0,
    };

    let mut m00 = 0.0;
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    let mut m20 = 0.0;
    let mut m02 = 0.0;

    for ((row, col), &value) in window.indexed_iter() {
        let w = (value as f64 - pedestal).max(0.0);
        if w == 0.0 {
            continue;
        }
        let x = col as f64;
        let y = row as f64;
        m00 += w;
        m10 += x * w;
        m01 += y * w;
        m20 += x * x * w;
        m02 += y * y * w;
    }

    if m00 < f64::EPSILON {
        return SpotMoments::default();
    }

    let x = m10 / m00;
    let y = m01 / m00;

    // Raw-moment form can dip a hair below zero from cancellation
    let m_xx = (m20 / m00 - x * x).max(0.0);
    let m_yy = (m02 / m00 - y * y).max(0.0);

    SpotMoments {
        weight: m00,
        x,
        y,
        m_xx,
        m_yy,
    }
}

/// Measure the astigmatic focus error of `frame` inside `roi`
///
/// # Errors
/// [`RoiError`] if the ROI is empty or does not fit in the frame.
pub fn extract(frame: &Frame, roi: &Roi, options: &ExtractorOptions) -> Result<ErrorSample, RoiError> {
    let view = frame.view();
    let window = roi.window(&view)?;
    let intensity = window.iter().map(|&v| v as f64).sum::<f64>();

    let moments = spot_moments(&window, options.background);
    let spread_sum = moments.m_xx + moments.m_yy;

    if moments.weight < f64::EPSILON || spread_sum < options.min_spread_px2 {
        return Ok(ErrorSample::blank(
            intensity,
            roi.width,
            roi.height,
            frame.timestamp,
        ));
    }

    let error = ((moments.m_xx - moments.m_yy) / spread_sum).clamp(-1.0, 1.0);

    Ok(ErrorSample {
        error,
        intensity,
        low_signal: false,
        spread_x: moments.m_xx,
        spread_y: moments.m_yy,
        centroid_x: moments.x,
        centroid_y: moments.y,
        timestamp: frame.timestamp,
    })
}

/// True when the spot centroid sits within `margin_px` of the ROI border
///
/// A PSF truncated by the ROI edge biases the second moments, so the
/// controller holds position instead of acting on such frames. A
/// non-positive margin disables the check.
pub fn centroid_near_edge(sample: &ErrorSample, roi: &Roi, margin_px: f64) -> bool {
    if margin_px <= 0.0 {
        return false;
    }
    if sample.low_signal {
        return true;
    }
    let max_x = roi.width as f64 - 1.0;
    let max_y = roi.height as f64 - 1.0;
    sample.centroid_x < margin_px
        || sample.centroid_x > max_x - margin_px
        || sample.centroid_y < margin_px
        || sample.centroid_y > max_y - margin_px
}
