//! Image measurements for the focus lock
//!
//! - **roi**: rectangular windows and bounds checking
//! - **astigmatism**: second-moment focus error of a spot inside an ROI
//! - **test_patterns**: synthetic spots for tests and simulation

pub mod astigmatism;
pub mod roi;
pub mod test_patterns;

pub use astigmatism::{
    centroid_near_edge, extract, spot_moments, BackgroundMode, ErrorSample, ExtractorOptions,
    SpotMoments,
};
pub use roi::{Roi, RoiError};
