//! Axis-aligned regions of interest in frame pixel coordinates

use ndarray::{s, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// ROI validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoiError {
    /// Zero width or height
    #[error("ROI has zero dimensions ({width}x{height})")]
    Empty { width: usize, height: usize },

    /// ROI does not fit inside the frame
    #[error("ROI {roi} extends beyond frame bounds ({frame_width}x{frame_height})")]
    OutOfBounds {
        roi: Roi,
        frame_width: usize,
        frame_height: usize,
    },
}

/// Rectangle `(x, y, width, height)` with `x` as column and `y` as row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Roi {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Square ROI of side `size` centred on `(center_x, center_y)`
    ///
    /// The corner saturates at zero, so a centre close to the frame origin
    /// yields an ROI shifted inward rather than a negative origin.
    pub fn centered(center_x: usize, center_y: usize, size: usize) -> Self {
        let half = size / 2;
        Self::new(
            center_x.saturating_sub(half),
            center_y.saturating_sub(half),
            size,
            size,
        )
    }

    /// One past the last column
    pub fn x_end(&self) -> usize {
        self.x + self.width
    }

    /// One past the last row
    pub fn y_end(&self) -> usize {
        self.y + self.height
    }

    /// Geometric centre in frame coordinates
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + (self.width as f64 - 1.0) / 2.0,
            self.y as f64 + (self.height as f64 - 1.0) / 2.0,
        )
    }

    /// Check that the ROI is non-empty and lies inside a `frame_width` x `frame_height` frame
    pub fn validate_for_frame(&self, frame_width: usize, frame_height: usize) -> Result<(), RoiError> {
        if self.width == 0 || self.height == 0 {
            return Err(RoiError::Empty {
                width: self.width,
                height: self.height,
            });
        }

        let fits_x = self.x.checked_add(self.width).is_some_and(|end| end <= frame_width);
        let fits_y = self.y.checked_add(self.height).is_some_and(|end| end <= frame_height);
        if !fits_x || !fits_y {
            return Err(RoiError::OutOfBounds {
                roi: *self,
                frame_width,
                frame_height,
            });
        }

        Ok(())
    }

    /// Borrow the ROI window out of a full frame
    pub fn window<'a, T>(&self, frame: &ArrayView2<'a, T>) -> Result<ArrayView2<'a, T>, RoiError> {
        let (height, width) = frame.dim();
        self.validate_for_frame(width, height)?;
        Ok(frame
            .clone()
            .slice_move(s![self.y..self.y_end(), self.x..self.x_end()]))
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({}, {}) {}x{}",
            self.x, self.y, self.width, self.height
        )
    }
}
