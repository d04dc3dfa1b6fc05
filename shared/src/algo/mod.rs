//! Numerical helpers shared by the focus-lock crates

pub mod stats;

pub use stats::{mean_and_std, median, pearson_correlation};
