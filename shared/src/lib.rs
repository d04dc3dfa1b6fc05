//! Shared components for the focus lock
//!
//! Hardware capability traits (frames in, Z commands out), the image
//! measurements the controller consumes, and the small statistics helpers
//! used by calibration. The engine itself lives in the `focuslock` crate.

pub mod algo;
pub mod camera_interface;
pub mod image_proc;
pub mod stage_interface;
