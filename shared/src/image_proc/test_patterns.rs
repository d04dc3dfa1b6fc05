//! Synthetic spot images for exercising the focus-error pipeline
//!
//! Renders elliptical Gaussian spots like the ones an astigmatic detection
//! path produces on either side of focus, with optional seeded read noise so
//! tests are reproducible.

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Render an axis-aligned elliptical Gaussian spot
///
/// # Arguments
/// * `width`, `height` - Image size in pixels
/// * `cx`, `cy` - Spot centre (column, row)
/// * `sigma_x`, `sigma_y` - Gaussian widths along each axis, pixels
/// * `peak` - Peak amplitude above background, DN
/// * `background` - Constant pedestal, DN
///
/// Values saturate at `u16::MAX`.
#[allow(clippy::too_many_arguments)]
pub fn astigmatic_spot(
    width: usize,
    height: usize,
    cx: f64,
    cy: f64,
    sigma_x: f64,
    sigma_y: f64,
    peak: f64,
    background: f64,
) -> Array2<u16> {
    let inv_2sx2 = 1.0 / (2.0 * sigma_x * sigma_x);
    let inv_2sy2 = 1.0 / (2.0 * sigma_y * sigma_y);

    Array2::from_shape_fn((height, width), |(row, col)| {
        let dx = col as f64 - cx;
        let dy = row as f64 - cy;
        let value = background + peak * (-(dx * dx * inv_2sx2 + dy * dy * inv_2sy2)).exp();
        to_pixel(value)
    })
}

/// Add zero-mean Gaussian read noise with a fixed seed
///
/// A non-positive `sigma` returns the image unchanged.
pub fn add_read_noise(image: &Array2<u16>, sigma: f64, seed: u64) -> Array2<u16> {
    if sigma <= 0.0 {
        return image.clone();
    }
    let Ok(normal) = Normal::new(0.0, sigma) else {
        return image.clone();
    };

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    image.mapv(|v| to_pixel(v as f64 + normal.sample(&mut rng)))
}

fn to_pixel(value: f64) -> u16 {
    value.round().clamp(0.0, u16::MAX as f64) as u16
}
